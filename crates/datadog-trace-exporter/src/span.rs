// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Meta key carrying the upper 64 bits of a 128-bit trace id.
pub const TRACE_ID_HIGH_TAG: &str = "_dd.p.tid";
/// Meta key holding the JSON rendering of span events when they are not sent natively.
pub const SPAN_EVENTS_TAG: &str = "events";
pub const ERROR_TYPE_TAG: &str = "error.type";
pub const ERROR_MESSAGE_TAG: &str = "error.message";
pub const ERROR_STACK_TAG: &str = "error.stack";

/// Error attached to a span. Folded into meta at encoding time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanError {
    pub type_name: String,
    pub message: String,
    pub stack: String,
}

/// A timestamped annotation on a span, e.g. a caught exception.
///
/// Attribute values are strings, booleans, numbers or flat arrays of those; anything else is
/// skipped when events are sent natively.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// A finished span, immutable once handed to the writer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Span {
    pub trace_id: u128,
    pub span_id: u64,
    /// `None` (or `Some(0)`) means the span is a root span.
    pub parent_id: Option<u64>,
    pub service: String,
    pub name: String,
    pub resource: String,
    pub r#type: Option<String>,
    /// Nanoseconds since the epoch.
    pub start: i64,
    /// Nanoseconds, never negative.
    pub duration: i64,
    pub error: bool,
    pub error_details: Option<SpanError>,
    pub meta: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// Structured payloads (e.g. AppSec data), each shipped as an opaque msgpack blob.
    /// `null` values are left out.
    pub meta_struct: BTreeMap<String, Value>,
    pub span_events: Vec<SpanEvent>,
}

/// Every span of one trace, in order. Never empty when handed to an encoder.
pub type Trace = Vec<Span>;

impl Span {
    pub fn new(trace_id: u128, span_id: u64, name: &str) -> Self {
        Span {
            trace_id,
            span_id,
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Lower 64 bits of the trace id, which is what goes on the wire as `trace_id`.
    pub fn trace_id_low(&self) -> u64 {
        self.trace_id as u64
    }

    pub fn trace_id_high(&self) -> u64 {
        (self.trace_id >> 64) as u64
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id.filter(|id| *id != 0)
    }

    pub fn span_type(&self) -> Option<&str> {
        self.r#type.as_deref().filter(|t| !t.is_empty())
    }

    pub fn has_error(&self) -> bool {
        self.error || self.error_details.is_some()
    }

    /// Meta entries the encoder adds on top of `meta`: the high trace id bits and the folded error
    /// fields, skipping empty values and keys the span already sets itself.
    pub fn derived_meta(&self) -> impl Iterator<Item = (&'static str, Cow<'_, str>)> + '_ {
        let high = self.trace_id_high();
        let trace_id_high = (high != 0 && !self.meta.contains_key(TRACE_ID_HIGH_TAG))
            .then(|| (TRACE_ID_HIGH_TAG, Cow::Owned(format!("{high:016x}"))));
        let error = self.error_details.iter().flat_map(|details| {
            [
                (ERROR_TYPE_TAG, details.type_name.as_str()),
                (ERROR_MESSAGE_TAG, details.message.as_str()),
                (ERROR_STACK_TAG, details.stack.as_str()),
            ]
        });
        trace_id_high.into_iter().chain(
            error
                .filter(move |(key, value)| !value.is_empty() && !self.meta.contains_key(*key))
                .map(|(key, value)| (key, Cow::Borrowed(value))),
        )
    }

    /// JSON rendering of the span events, for encodings without a dedicated field. `None` when
    /// there are no events or `meta` already carries an `events` entry.
    pub fn span_events_json(&self) -> Option<String> {
        if self.span_events.is_empty() || self.meta.contains_key(SPAN_EVENTS_TAG) {
            return None;
        }
        serde_json::to_string(&self.span_events)
            .inspect_err(|e| debug!("Dropping span events that cannot be serialized: {e}"))
            .ok()
    }

    /// Metrics that can be encoded. NaN values are dropped.
    pub fn encodable_metrics(&self) -> impl Iterator<Item = (&str, f64)> {
        self.metrics
            .iter()
            .filter(|(_, value)| !value.is_nan())
            .map(|(key, value)| (key.as_str(), *value))
    }
}
