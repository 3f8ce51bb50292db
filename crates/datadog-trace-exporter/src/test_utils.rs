// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span fixtures, an independent decoder for both payload layouts, and an in-memory transport.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rmpv::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::agent_client::{AgentResponse, SendRequest, TraceTransport};
use crate::config::ProtocolVersion;
use crate::error::ClientError;
use crate::span::{Span, Trace};

/// A span as read back from a payload. Absent parents and types decode to `0` and `""`.
///
/// `meta_struct` keeps the raw msgpack blob of each entry and `span_events` the undecoded event
/// maps; only v0.4 payloads carry either.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedSpan {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    pub service: String,
    pub name: String,
    pub resource: String,
    pub r#type: String,
    pub start: i64,
    pub duration: i64,
    pub error: i64,
    pub meta: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub meta_struct: BTreeMap<String, Vec<u8>>,
    pub span_events: Vec<Value>,
}

pub fn create_test_span(trace_id: u128, span_id: u64, parent_id: Option<u64>) -> Span {
    Span {
        trace_id,
        span_id,
        parent_id,
        service: "test-service".to_string(),
        name: "web.request".to_string(),
        resource: "GET /".to_string(),
        r#type: Some("web".to_string()),
        start: 1_700_000_000_000_000_000,
        duration: 1_000_000,
        meta: BTreeMap::from([("env".to_string(), "test".to_string())]),
        ..Default::default()
    }
}

/// A root span with id 1 followed by `span_count - 1` children of it.
pub fn create_test_trace(trace_id: u128, span_count: u64) -> Trace {
    (1..=span_count.max(1))
        .map(|span_id| {
            let parent_id = (span_id > 1).then_some(1);
            create_test_span(trace_id, span_id, parent_id)
        })
        .collect()
}

pub fn decode_payload(
    protocol: ProtocolVersion,
    payload: &[u8],
) -> Result<Vec<Vec<DecodedSpan>>, String> {
    let value = read_payload(payload)?;
    match protocol {
        ProtocolVersion::V04 => as_array(&value)?
            .iter()
            .map(|trace| -> Result<Vec<DecodedSpan>, String> {
                as_array(trace)?.iter().map(decode_v04_span).collect()
            })
            .collect(),
        ProtocolVersion::V05 => {
            let parts = as_array(&value)?;
            let [strings, traces] = parts.as_slice() else {
                return Err(format!("expected [strings, traces], got {} parts", parts.len()));
            };
            let table = decode_strings(strings)?;
            as_array(traces)?
                .iter()
                .map(|trace| -> Result<Vec<DecodedSpan>, String> {
                    as_array(trace)?
                        .iter()
                        .map(|span| decode_v05_span(span, &table))
                        .collect()
                })
                .collect()
        }
    }
}

/// String table of a v0.5 payload.
pub fn decode_string_table(payload: &[u8]) -> Result<Vec<String>, String> {
    let value = read_payload(payload)?;
    let strings = as_array(&value)?
        .first()
        .ok_or_else(|| "empty payload".to_string())?;
    decode_strings(strings)
}

fn read_payload(payload: &[u8]) -> Result<Value, String> {
    let mut reader = payload;
    let value = rmpv::decode::read_value(&mut reader).map_err(|e| e.to_string())?;
    if !reader.is_empty() {
        return Err(format!("{} trailing bytes after payload", reader.len()));
    }
    Ok(value)
}

fn as_array(value: &Value) -> Result<&Vec<Value>, String> {
    value
        .as_array()
        .ok_or_else(|| format!("expected array, got {value}"))
}

fn as_str(value: &Value) -> Result<String, String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("expected string, got {value}"))
}

fn as_u64(value: &Value) -> Result<u64, String> {
    value
        .as_u64()
        .ok_or_else(|| format!("expected unsigned integer, got {value}"))
}

fn as_i64(value: &Value) -> Result<i64, String> {
    value
        .as_i64()
        .ok_or_else(|| format!("expected integer, got {value}"))
}

fn as_f64(value: &Value) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("expected float, got {value}"))
}

fn as_map(value: &Value) -> Result<&Vec<(Value, Value)>, String> {
    value
        .as_map()
        .ok_or_else(|| format!("expected map, got {value}"))
}

fn decode_strings(value: &Value) -> Result<Vec<String>, String> {
    as_array(value)?.iter().map(as_str).collect()
}

fn decode_v04_span(value: &Value) -> Result<DecodedSpan, String> {
    let mut span = DecodedSpan::default();
    for (key, field) in as_map(value)? {
        match as_str(key)?.as_str() {
            "trace_id" => span.trace_id = as_u64(field)?,
            "span_id" => span.span_id = as_u64(field)?,
            "parent_id" => span.parent_id = as_u64(field)?,
            "service" => span.service = as_str(field)?,
            "name" => span.name = as_str(field)?,
            "resource" => span.resource = as_str(field)?,
            "type" => span.r#type = as_str(field)?,
            "start" => span.start = as_i64(field)?,
            "duration" => span.duration = as_i64(field)?,
            "error" => span.error = as_i64(field)?,
            "meta" => {
                for (k, v) in as_map(field)? {
                    span.meta.insert(as_str(k)?, as_str(v)?);
                }
            }
            "metrics" => {
                for (k, v) in as_map(field)? {
                    span.metrics.insert(as_str(k)?, as_f64(v)?);
                }
            }
            "meta_struct" => {
                for (k, v) in as_map(field)? {
                    let blob = v
                        .as_slice()
                        .ok_or_else(|| format!("expected binary, got {v}"))?;
                    span.meta_struct.insert(as_str(k)?, blob.to_vec());
                }
            }
            "span_events" => span.span_events = as_array(field)?.clone(),
            other => return Err(format!("unexpected span field {other}")),
        }
    }
    Ok(span)
}

fn decode_v05_span(value: &Value, table: &[String]) -> Result<DecodedSpan, String> {
    let lookup = |value: &Value| -> Result<String, String> {
        let index = as_u64(value)? as usize;
        table
            .get(index)
            .cloned()
            .ok_or_else(|| format!("string reference {index} out of bounds"))
    };

    let fields = as_array(value)?;
    if fields.len() != 12 {
        return Err(format!("expected 12 span fields, got {}", fields.len()));
    }

    let mut meta = BTreeMap::new();
    for (k, v) in as_map(&fields[9])? {
        meta.insert(lookup(k)?, lookup(v)?);
    }
    let mut metrics = BTreeMap::new();
    for (k, v) in as_map(&fields[10])? {
        metrics.insert(lookup(k)?, as_f64(v)?);
    }

    Ok(DecodedSpan {
        service: lookup(&fields[0])?,
        name: lookup(&fields[1])?,
        resource: lookup(&fields[2])?,
        trace_id: as_u64(&fields[3])?,
        span_id: as_u64(&fields[4])?,
        parent_id: as_u64(&fields[5])?,
        start: as_i64(&fields[6])?,
        duration: as_i64(&fields[7])?,
        error: as_i64(&fields[8])?,
        meta,
        metrics,
        r#type: lookup(&fields[11])?,
        ..Default::default()
    })
}

/// Transport that records every request instead of sending it, answering with a fixed status.
pub struct RecordingTransport {
    sent: UnboundedSender<SendRequest>,
    status: Mutex<u16>,
}

impl RecordingTransport {
    pub fn new() -> (Self, UnboundedReceiver<SendRequest>) {
        let (sent, received) = unbounded_channel();
        (
            RecordingTransport {
                sent,
                status: Mutex::new(200),
            },
            received,
        )
    }

    /// Status returned for subsequent requests. Non-2xx statuses are reported as errors.
    pub fn respond_with(&self, status: u16) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[async_trait]
impl TraceTransport for RecordingTransport {
    async fn send(&self, request: SendRequest) -> Result<Option<AgentResponse>, ClientError> {
        if request.trace_count == 0 {
            return Ok(None);
        }
        let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);
        // the receiver may already be gone at the end of a test
        let _ = self.sent.send(request);
        if (200..300).contains(&status) {
            Ok(Some(AgentResponse {
                status,
                rate_by_service: None,
            }))
        } else {
            Err(ClientError::Status {
                status,
                body: String::new(),
            })
        }
    }
}
