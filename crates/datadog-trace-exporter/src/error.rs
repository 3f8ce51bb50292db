// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

/// Failure of one request to the agent. Always recoverable: the payload is dropped and the next
/// flush cycle proceeds normally.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to send traces to the agent: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse agent response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid agent url: {0}")]
    InvalidUrl(String),
    #[error("failed to reach the agent socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("failed to exchange traces with the agent: {0}")]
    Http(#[from] hyper::Error),
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// HTTP status of the failed request, when the agent answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Transport(err) => err.status().map(|status| status.as_u16()),
            ClientError::Decode(_)
            | ClientError::InvalidUrl(_)
            | ClientError::Socket(_)
            | ClientError::Http(_)
            | ClientError::Timeout(_) => None,
        }
    }
}

/// A trace that cannot be represented in msgpack. Only that trace is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{kind} of {length} entries does not fit a 32-bit msgpack length")]
    LengthOverflow { kind: &'static str, length: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid agent url {0:?}, expected an http://, https:// or unix:// url")]
    InvalidUrl(String),
    #[error("unsupported trace protocol version {0:?}, expected 0.4 or 0.5")]
    InvalidProtocolVersion(String),
    #[error("invalid flush interval {0:?}, expected a number of milliseconds")]
    InvalidFlushInterval(String),
    #[error("invalid {name} value {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("payload soft limit of {0} bytes must stay under the agent's 50 MiB limit")]
    SoftLimitTooLarge(usize),
    #[error("trace writer must be created from within a Tokio runtime")]
    NoRuntime,
}
