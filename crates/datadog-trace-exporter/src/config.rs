// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::container;
use crate::encoder::{AGENT_HARD_LIMIT_BYTES, DEFAULT_SOFT_LIMIT_BYTES};
use crate::error::ConfigError;

const DEFAULT_AGENT_HOST: &str = "127.0.0.1";
const DEFAULT_AGENT_PORT: u16 = 8126;
const DEFAULT_FLUSH_INTERVAL_MS: i64 = 2000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2000;
const UNIX_SCHEME: &str = "unix://";

/// Agent trace intake version. Selects both the endpoint path and the payload layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    #[default]
    V04,
    V05,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V04 => "0.4",
            ProtocolVersion::V05 => "0.5",
        }
    }

    /// Agent endpoint path for this version, e.g. `/v0.4/traces`.
    pub fn path(&self) -> &'static str {
        match self {
            ProtocolVersion::V04 => "/v0.4/traces",
            ProtocolVersion::V05 => "/v0.5/traces",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_start_matches('v') {
            "0.4" => Ok(ProtocolVersion::V04),
            "0.5" => Ok(ProtocolVersion::V05),
            _ => Err(ConfigError::InvalidProtocolVersion(value.to_string())),
        }
    }
}

/// When buffered traces are sent to the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushInterval {
    /// Every added trace is flushed right away.
    Immediate,
    /// A timer armed by the first trace of a cycle flushes after the interval.
    Every(Duration),
    /// Only explicit flushes (and the soft limit) send payloads.
    Manual,
}

impl FlushInterval {
    /// Maps a signed millisecond value: `0` is immediate, negative is manual.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => FlushInterval::Immediate,
            ms if ms < 0 => FlushInterval::Manual,
            ms => FlushInterval::Every(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}

impl Default for FlushInterval {
    fn default() -> Self {
        FlushInterval::from_millis(DEFAULT_FLUSH_INTERVAL_MS)
    }
}

/// Values of the `Datadog-Meta-*` headers describing this tracer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracerMetadata {
    pub language: String,
    pub language_version: String,
    pub language_interpreter: String,
    pub tracer_version: String,
}

impl Default for TracerMetadata {
    fn default() -> Self {
        TracerMetadata {
            language: "rust".to_string(),
            // set by build.rs from the compiler that built this crate
            language_version: env!("DD_TRACE_RUSTC_VERSION").to_string(),
            language_interpreter: "rustc".to_string(),
            tracer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Base url of the agent, without a trailing slash. A `unix:///path` url reaches the agent
    /// over a Unix domain socket.
    pub agent_url: String,
    pub protocol_version: ProtocolVersion,
    /// Fall back to v0.4 for good when the agent does not support v0.5.
    pub protocol_downgrade: bool,
    pub flush_interval: FlushInterval,
    /// Encoded size, in bytes, past which a flush is triggered right away.
    pub soft_limit_bytes: usize,
    pub request_timeout: Duration,
    /// Log the hex bytes of every encoded trace at debug level.
    pub debug_encoding: bool,
    /// Send span events as a dedicated v0.4 field rather than JSON in `meta.events`.
    pub native_span_events: bool,
    pub container_id: Option<String>,
    pub metadata: TracerMetadata,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent_url: format!("http://{DEFAULT_AGENT_HOST}:{DEFAULT_AGENT_PORT}"),
            protocol_version: ProtocolVersion::default(),
            protocol_downgrade: true,
            flush_interval: FlushInterval::default(),
            soft_limit_bytes: DEFAULT_SOFT_LIMIT_BYTES,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            debug_encoding: false,
            native_span_events: false,
            container_id: None,
            metadata: TracerMetadata::default(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Config, ConfigError> {
        // DD_TRACE_AGENT_URL takes precedence over host and port
        let agent_url = match non_empty_var("DD_TRACE_AGENT_URL") {
            Some(url) => url,
            None => {
                let host = non_empty_var("DD_AGENT_HOST")
                    .unwrap_or_else(|| DEFAULT_AGENT_HOST.to_string());
                let port = match non_empty_var("DD_TRACE_AGENT_PORT") {
                    Some(port) => parse_number::<u16>("DD_TRACE_AGENT_PORT", &port)?,
                    None => DEFAULT_AGENT_PORT,
                };
                format!("http://{host}:{port}")
            }
        };

        let protocol_version = match non_empty_var("DD_TRACE_AGENT_PROTOCOL_VERSION") {
            Some(version) => version.parse()?,
            None => ProtocolVersion::default(),
        };

        let flush_interval = match non_empty_var("DD_TRACE_FLUSH_INTERVAL") {
            Some(millis) => FlushInterval::from_millis(
                millis
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidFlushInterval(millis.clone()))?,
            ),
            None => FlushInterval::default(),
        };

        let soft_limit_bytes = match non_empty_var("DD_TRACE_PAYLOAD_SOFT_LIMIT") {
            Some(limit) => parse_number::<usize>("DD_TRACE_PAYLOAD_SOFT_LIMIT", &limit)?,
            None => DEFAULT_SOFT_LIMIT_BYTES,
        };

        let request_timeout = match non_empty_var("DD_TRACE_AGENT_TIMEOUT") {
            Some(millis) => {
                Duration::from_millis(parse_number::<u64>("DD_TRACE_AGENT_TIMEOUT", &millis)?)
            }
            None => Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        };

        let config = Config {
            agent_url: normalize_agent_url(&agent_url)?,
            protocol_version,
            protocol_downgrade: parse_bool(
                env::var("DD_TRACE_AGENT_PROTOCOL_DOWNGRADE").ok().as_deref(),
                true,
            ),
            flush_interval,
            soft_limit_bytes,
            request_timeout,
            debug_encoding: parse_bool(env::var("DD_TRACE_ENCODING_DEBUG").ok().as_deref(), false),
            native_span_events: parse_bool(
                env::var("DD_TRACE_NATIVE_SPAN_EVENTS").ok().as_deref(),
                false,
            ),
            container_id: container::container_id().map(str::to_string),
            metadata: TracerMetadata::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants `Config::new` enforces, for configs built by hand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_agent_url(&self.agent_url)?;
        if self.soft_limit_bytes >= AGENT_HARD_LIMIT_BYTES {
            return Err(ConfigError::SoftLimitTooLarge(self.soft_limit_bytes));
        }
        Ok(())
    }

    /// Socket path of a `unix://` agent url.
    pub fn agent_socket(&self) -> Option<&Path> {
        self.agent_url.strip_prefix(UNIX_SCHEME).map(Path::new)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_number<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        })
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

/// Accepts `http://` and `https://` agents, and `unix://` sockets named by an absolute path on
/// platforms that have them.
fn normalize_agent_url(url: &str) -> Result<String, ConfigError> {
    let url = url.trim();
    if let Some(path) = url.strip_prefix(UNIX_SCHEME) {
        if cfg!(unix) && path.len() > 1 && path.starts_with('/') {
            return Ok(url.to_string());
        }
        return Err(ConfigError::InvalidUrl(url.to_string()));
    }
    let url = url.trim_end_matches('/');
    let authority = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| ConfigError::InvalidUrl(url.to_string()))?;
    if authority.is_empty() {
        return Err(ConfigError::InvalidUrl(url.to_string()));
    }
    Ok(url.to_string())
}
