// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary trace encoders for the agent's `/v0.4/traces` and `/v0.5/traces` endpoints.
//!
//! Both variants write msgpack by hand into a [`Chunk`] and share one [`StringCache`], which
//! interns every distinct string of the current flush cycle in first-seen order:
//! - [`v04::V04Encoder`] copies the cached string bytes inline at every occurrence;
//! - [`v05::V05Encoder`] writes only the integer id of the cached string, and ships the cache
//!   itself as the first element of the payload.
//!
//! The encoders are selected once, when the writer is built, and are never mixed within a payload.

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde_json::Value;
use tracing::debug;

use crate::chunk::Chunk;
use crate::config::{Config, ProtocolVersion};
use crate::error::EncodeError;
use crate::span::Span;

pub mod tokens;
pub mod v04;
pub mod v05;

/// Advisory payload size that triggers a flush. Well under the agent's hard limit.
pub const DEFAULT_SOFT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Size above which the agent rejects a payload outright.
pub const AGENT_HARD_LIMIT_BYTES: usize = 50 * 1024 * 1024;

/// Serializes traces into one of the agent wire formats.
///
/// `encode` runs on the application's hot path and only ever appends to internal buffers.
/// `make_payload` finalizes those buffers into an owned payload and resets the encoder, so the
/// returned bytes never alias the next cycle's buffers. The two must not run concurrently on the
/// same instance; the writer serializes them behind a single lock.
pub trait TraceEncoder: Send {
    fn protocol(&self) -> ProtocolVersion;

    /// Number of traces encoded since the last reset.
    fn count(&self) -> usize;

    /// Encodes one non-empty trace. Returns `true` when the soft limit has been exceeded and the
    /// caller should flush right away.
    ///
    /// On error nothing of the trace is left in the payload and the encoder stays usable.
    fn encode(&mut self, trace: &[Span]) -> Result<bool, EncodeError>;

    /// Builds the final payload and resets the encoder as its last step.
    fn make_payload(&mut self) -> Vec<u8>;
}

/// Settings shared by both encoder variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderOptions {
    pub soft_limit: usize,
    pub debug_encoding: bool,
    /// Ship span events as a top-level `span_events` field instead of JSON in `meta.events`.
    /// Only the v0.4 layout has room for it.
    pub native_span_events: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            soft_limit: DEFAULT_SOFT_LIMIT_BYTES,
            debug_encoding: false,
            native_span_events: false,
        }
    }
}

impl From<&Config> for EncoderOptions {
    fn from(config: &Config) -> Self {
        EncoderOptions {
            soft_limit: config.soft_limit_bytes,
            debug_encoding: config.debug_encoding,
            native_span_events: config.native_span_events,
        }
    }
}

pub fn new_encoder(protocol: ProtocolVersion, options: EncoderOptions) -> Box<dyn TraceEncoder> {
    match protocol {
        ProtocolVersion::V04 => Box::new(v04::V04Encoder::new(options)),
        ProtocolVersion::V05 => Box::new(v05::V05Encoder::new(options)),
    }
}

/// Position of an interned string: its table id and where its msgpack bytes live in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedString {
    pub id: u32,
    start: usize,
    end: usize,
}

/// Per-cycle string interning table.
///
/// The empty string is always entry 0 so that absent string fields reference a valid id.
#[derive(Debug)]
pub struct StringCache {
    entries: HashMap<Box<str>, CachedString, FnvBuildHasher>,
    bytes: Chunk,
    next_id: u32,
}

impl Default for StringCache {
    fn default() -> Self {
        let mut cache = StringCache {
            entries: HashMap::with_hasher(FnvBuildHasher::default()),
            bytes: Chunk::default(),
            next_id: 0,
        };
        cache.intern_empty();
        cache
    }
}

impl StringCache {
    /// Returns the cached entry for `value`, writing its bytes on first sight.
    pub fn intern(&mut self, value: &str) -> Result<CachedString, EncodeError> {
        if let Some(cached) = self.entries.get(value) {
            return Ok(*cached);
        }
        // the table length is itself written as a u32
        if self.next_id == u32::MAX {
            return Err(EncodeError::LengthOverflow {
                kind: "string table",
                length: self.entries.len() + 1,
            });
        }
        let id = self.next_id;
        let start = self.bytes.len();
        let end = start + self.bytes.write(value)?;
        let cached = CachedString { id, start, end };
        self.entries.insert(value.into(), cached);
        self.next_id += 1;
        Ok(cached)
    }

    fn intern_empty(&mut self) {
        self.bytes.extend_from_slice(tokens::str_header(0));
        self.entries.insert(
            "".into(),
            CachedString {
                id: 0,
                start: 0,
                end: 1,
            },
        );
        self.next_id = 1;
    }

    /// Msgpack encoding of a cached string.
    pub fn bytes_of(&self, cached: CachedString) -> &[u8] {
        &self.bytes.as_slice()[cached.start..cached.end]
    }

    /// Number of distinct strings, the empty string included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> &Chunk {
        &self.bytes
    }

    pub(crate) fn table_len(&self) -> u32 {
        self.next_id
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.bytes.clear();
        self.intern_empty();
    }
}

/// State and primitives shared by both wire variants.
#[derive(Debug)]
pub(crate) struct EncoderBase {
    pub(crate) trace_bytes: Chunk,
    pub(crate) strings: StringCache,
    trace_count: u32,
    soft_limit: usize,
    debug_encoding: bool,
}

impl EncoderBase {
    pub(crate) fn new(options: EncoderOptions) -> Self {
        EncoderBase {
            trace_bytes: Chunk::default(),
            strings: StringCache::default(),
            trace_count: 0,
            soft_limit: options.soft_limit,
            debug_encoding: options.debug_encoding,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.trace_count as usize
    }

    pub(crate) fn count_u32(&self) -> u32 {
        self.trace_count
    }

    /// Writes the span array prefix of a trace and returns where the trace starts.
    pub(crate) fn begin_trace(&mut self, span_count: usize) -> Result<usize, EncodeError> {
        if self.trace_count == u32::MAX {
            return Err(EncodeError::LengthOverflow {
                kind: "payload",
                length: self.count() + 1,
            });
        }
        let start = self.trace_bytes.len();
        write_array_prefix(&mut self.trace_bytes, span_count)?;
        Ok(start)
    }

    pub(crate) fn finish_trace(&mut self, start: usize) -> bool {
        self.trace_count += 1;
        if self.debug_encoding {
            let hex = self.trace_bytes.as_slice()[start..]
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            debug!("Adding encoded trace to buffer: {hex}");
        }
        self.exceeds_soft_limit()
    }

    /// Forgets the partially written trace starting at `start`.
    pub(crate) fn abort_trace(&mut self, start: usize) {
        self.trace_bytes.truncate(start);
    }

    pub(crate) fn exceeds_soft_limit(&self) -> bool {
        self.trace_bytes.len() > self.soft_limit || self.strings.bytes().len() > self.soft_limit
    }

    pub(crate) fn reset(&mut self) {
        self.trace_count = 0;
        self.trace_bytes.clear();
        self.strings.reset();
    }
}

/// Msgpack lengths are 32 bits wide.
pub(crate) fn checked_len(kind: &'static str, length: usize) -> Result<u32, EncodeError> {
    u32::try_from(length).map_err(|_| EncodeError::LengthOverflow { kind, length })
}

/// 64-bit ids always take the fixed-width form, so every id costs exactly nine bytes.
pub(crate) fn write_id(bytes: &mut Chunk, id: u64) {
    bytes.push_marker_u64(tokens::UINT64, id);
}

pub(crate) fn write_long(bytes: &mut Chunk, value: i64) {
    if value < 0 {
        bytes.push_marker_u64(tokens::INT64, value as u64);
    } else {
        bytes.push_marker_u64(tokens::UINT64, value as u64);
    }
}

pub(crate) fn write_uint(bytes: &mut Chunk, value: u32) {
    match u16::try_from(value) {
        Ok(small) => bytes.extend_from_slice(tokens::uint(small)),
        Err(_) => bytes.push_marker_u32(tokens::UINT32, value),
    }
}

pub(crate) fn write_float(bytes: &mut Chunk, value: f64) {
    bytes.push_marker_u64(tokens::FLOAT64, value.to_bits());
}

pub(crate) fn write_bool(bytes: &mut Chunk, value: bool) {
    bytes.push(if value { tokens::TRUE } else { tokens::FALSE });
}

pub(crate) fn write_array_prefix(bytes: &mut Chunk, length: usize) -> Result<(), EncodeError> {
    bytes.push_marker_u32(tokens::ARRAY32, checked_len("array", length)?);
    Ok(())
}

pub(crate) fn write_map_prefix(bytes: &mut Chunk, length: usize) -> Result<(), EncodeError> {
    bytes.push_marker_u32(tokens::MAP32, checked_len("map", length)?);
    Ok(())
}

/// Opaque msgpack `bin` blob.
pub(crate) fn write_bin(bytes: &mut Chunk, value: &[u8]) -> Result<(), EncodeError> {
    bytes.push_marker_u32(tokens::BIN32, checked_len("binary", value.len())?);
    bytes.extend_from_slice(value);
    Ok(())
}

/// Encodes an arbitrary JSON value as the equivalent msgpack value.
pub(crate) fn write_json(bytes: &mut Chunk, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Null => bytes.push(tokens::NIL),
        Value::Bool(value) => write_bool(bytes, *value),
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                write_long(bytes, value);
            } else if let Some(value) = number.as_u64() {
                write_id(bytes, value);
            } else {
                write_float(bytes, number.as_f64().unwrap_or_default());
            }
        }
        Value::String(value) => {
            bytes.write(value)?;
        }
        Value::Array(items) => {
            write_array_prefix(bytes, items.len())?;
            for item in items {
                write_json(bytes, item)?;
            }
        }
        Value::Object(fields) => {
            write_map_prefix(bytes, fields.len())?;
            for (key, field) in fields {
                bytes.write(key)?;
                write_json(bytes, field)?;
            }
        }
    }
    Ok(())
}

/// Top-level array prefix of a payload.
pub(crate) fn push_array_prefix(payload: &mut Vec<u8>, length: u32) {
    payload.push(tokens::ARRAY32);
    payload.extend_from_slice(&length.to_be_bytes());
}
