// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `v0.4` encoding: an array of traces, each an array of span maps with inline string keys and
//! values.

use fnv::FnvBuildHasher;
use hashbrown::HashSet;
use serde_json::Value;
use tracing::debug;

use crate::chunk::Chunk;
use crate::config::ProtocolVersion;
use crate::encoder::{
    checked_len, push_array_prefix, tokens, write_bin, write_bool, write_float, write_id,
    write_json, write_long, EncoderBase, EncoderOptions, TraceEncoder,
};
use crate::error::EncodeError;
use crate::span::{Span, SpanEvent, SPAN_EVENTS_TAG};

/// Fields every span map carries, before the optional `parent_id`, `type`, `meta_struct` and
/// `span_events`.
const BASE_SPAN_FIELDS: u8 = 10;

const STRING_ATTRIBUTE: u16 = 0;
const BOOL_ATTRIBUTE: u16 = 1;
const INT_ATTRIBUTE: u16 = 2;
const DOUBLE_ATTRIBUTE: u16 = 3;
const ARRAY_ATTRIBUTE: u16 = 4;

#[derive(Debug)]
pub struct V04Encoder {
    base: EncoderBase,
    native_span_events: bool,
    /// Scratch buffer for the msgpack blobs of `meta_struct`.
    blob: Chunk,
    /// Span event attribute keys already reported as unsupported.
    reported_attributes: HashSet<String, FnvBuildHasher>,
}

impl V04Encoder {
    pub fn new(options: EncoderOptions) -> Self {
        V04Encoder {
            base: EncoderBase::new(options),
            native_span_events: options.native_span_events,
            blob: Chunk::with_capacity(1024),
            reported_attributes: HashSet::with_hasher(FnvBuildHasher::default()),
        }
    }

    fn write_string(&mut self, value: &str) -> Result<(), EncodeError> {
        let cached = self.base.strings.intern(value)?;
        self.base
            .trace_bytes
            .extend_from_slice(self.base.strings.bytes_of(cached));
        Ok(())
    }

    fn write_small_uint(&mut self, value: u16) {
        self.base.trace_bytes.extend_from_slice(tokens::uint(value));
    }

    fn encode_span(&mut self, span: &Span) -> Result<(), EncodeError> {
        let parent_id = span.parent_id();
        let span_type = span.span_type();
        let native_events = self.native_span_events && !span.span_events.is_empty();
        let has_meta_struct = span.meta_struct.values().any(|value| !value.is_null());
        let events_json = if self.native_span_events {
            None
        } else {
            span.span_events_json()
        };
        let fields = BASE_SPAN_FIELDS
            + u8::from(parent_id.is_some())
            + u8::from(span_type.is_some())
            + u8::from(has_meta_struct)
            + u8::from(native_events);
        self.base.trace_bytes.push(tokens::FIXMAP | fields);

        if let Some(span_type) = span_type {
            self.write_string("type")?;
            self.write_string(span_type)?;
        }
        self.write_string("trace_id")?;
        write_id(&mut self.base.trace_bytes, span.trace_id_low());
        self.write_string("span_id")?;
        write_id(&mut self.base.trace_bytes, span.span_id);
        if let Some(parent_id) = parent_id {
            self.write_string("parent_id")?;
            write_id(&mut self.base.trace_bytes, parent_id);
        }
        self.write_string("name")?;
        self.write_string(&span.name)?;
        self.write_string("resource")?;
        self.write_string(&span.resource)?;
        self.write_string("service")?;
        self.write_string(&span.service)?;
        self.write_string("error")?;
        self.write_small_uint(u16::from(span.has_error()));
        self.write_string("start")?;
        write_long(&mut self.base.trace_bytes, span.start);
        self.write_string("duration")?;
        write_long(&mut self.base.trace_bytes, span.duration);

        self.write_string("meta")?;
        let meta = self.base.trace_bytes.placeholder_u32(tokens::MAP32);
        let mut entries = 0;
        for (key, value) in &span.meta {
            self.write_string(key)?;
            self.write_string(value)?;
            entries += 1;
        }
        for (key, value) in span.derived_meta() {
            self.write_string(key)?;
            self.write_string(&value)?;
            entries += 1;
        }
        if let Some(events) = &events_json {
            self.write_string(SPAN_EVENTS_TAG)?;
            self.write_string(events)?;
            entries += 1;
        }
        self.base.trace_bytes.fill(meta, checked_len("map", entries)?);

        self.write_string("metrics")?;
        let metrics = self.base.trace_bytes.placeholder_u32(tokens::MAP32);
        let mut entries = 0;
        for (key, value) in span.encodable_metrics() {
            self.write_string(key)?;
            write_float(&mut self.base.trace_bytes, value);
            entries += 1;
        }
        self.base
            .trace_bytes
            .fill(metrics, checked_len("map", entries)?);

        if has_meta_struct {
            self.write_string("meta_struct")?;
            let meta_struct = self.base.trace_bytes.placeholder_u32(tokens::MAP32);
            let mut entries = 0;
            for (key, value) in span.meta_struct.iter().filter(|(_, v)| !v.is_null()) {
                self.write_string(key)?;
                self.blob.clear();
                write_json(&mut self.blob, value)?;
                write_bin(&mut self.base.trace_bytes, self.blob.as_slice())?;
                entries += 1;
            }
            self.base
                .trace_bytes
                .fill(meta_struct, checked_len("map", entries)?);
        }

        if native_events {
            self.write_string("span_events")?;
            let events = self.base.trace_bytes.placeholder_u32(tokens::ARRAY32);
            for event in &span.span_events {
                self.encode_span_event(event)?;
            }
            self.base
                .trace_bytes
                .fill(events, checked_len("array", span.span_events.len())?);
        }
        Ok(())
    }

    fn encode_span_event(&mut self, event: &SpanEvent) -> Result<(), EncodeError> {
        let has_attributes = event.attributes.values().any(is_supported_attribute);
        self.base
            .trace_bytes
            .push(tokens::FIXMAP | (2 + u8::from(has_attributes)));
        self.write_string("name")?;
        self.write_string(&event.name)?;
        self.write_string("time_unix_nano")?;
        write_id(&mut self.base.trace_bytes, event.time_unix_nano);
        if !has_attributes {
            for key in event.attributes.keys() {
                self.report_unsupported(key);
            }
            return Ok(());
        }

        self.write_string("attributes")?;
        let attributes = self.base.trace_bytes.placeholder_u32(tokens::MAP32);
        let mut entries = 0;
        for (key, value) in &event.attributes {
            if !is_supported_attribute(value) {
                self.report_unsupported(key);
                continue;
            }
            self.write_string(key)?;
            match value {
                Value::Array(items) => {
                    self.base.trace_bytes.push(tokens::FIXMAP | 2);
                    self.write_string("type")?;
                    self.write_small_uint(ARRAY_ATTRIBUTE);
                    self.write_string("array_value")?;
                    self.base.trace_bytes.push(tokens::FIXMAP | 1);
                    self.write_string("values")?;
                    let values = self.base.trace_bytes.placeholder_u32(tokens::ARRAY32);
                    let mut count = 0;
                    for item in items {
                        if self.write_scalar_attribute(item)? {
                            count += 1;
                        } else {
                            self.report_unsupported(key);
                        }
                    }
                    self.base
                        .trace_bytes
                        .fill(values, checked_len("array", count)?);
                }
                scalar => {
                    self.write_scalar_attribute(scalar)?;
                }
            }
            entries += 1;
        }
        self.base
            .trace_bytes
            .fill(attributes, checked_len("map", entries)?);
        Ok(())
    }

    /// Writes a typed attribute value. Returns `false`, writing nothing, for non-scalar values.
    fn write_scalar_attribute(&mut self, value: &Value) -> Result<bool, EncodeError> {
        if !is_scalar(value) {
            return Ok(false);
        }
        self.base.trace_bytes.push(tokens::FIXMAP | 2);
        self.write_string("type")?;
        match value {
            Value::String(value) => {
                self.write_small_uint(STRING_ATTRIBUTE);
                self.write_string("string_value")?;
                self.write_string(value)?;
            }
            Value::Bool(value) => {
                self.write_small_uint(BOOL_ATTRIBUTE);
                self.write_string("bool_value")?;
                write_bool(&mut self.base.trace_bytes, *value);
            }
            Value::Number(number) => match number.as_i64() {
                Some(value) => {
                    self.write_small_uint(INT_ATTRIBUTE);
                    self.write_string("int_value")?;
                    write_long(&mut self.base.trace_bytes, value);
                }
                None => {
                    self.write_small_uint(DOUBLE_ATTRIBUTE);
                    self.write_string("double_value")?;
                    write_float(
                        &mut self.base.trace_bytes,
                        number.as_f64().unwrap_or_default(),
                    );
                }
            },
            Value::Null | Value::Array(_) | Value::Object(_) => {}
        }
        Ok(true)
    }

    fn report_unsupported(&mut self, key: &str) {
        if !self.reported_attributes.contains(key) {
            debug!("Encountered unsupported data type for span event v0.4 encoding, key: {key}");
            self.reported_attributes.insert(key.to_string());
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Bool(_) | Value::Number(_))
}

/// Scalars, and flat arrays holding at least one scalar.
fn is_supported_attribute(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().any(is_scalar),
        value => is_scalar(value),
    }
}

impl TraceEncoder for V04Encoder {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::V04
    }

    fn count(&self) -> usize {
        self.base.count()
    }

    fn encode(&mut self, trace: &[Span]) -> Result<bool, EncodeError> {
        let start = self.base.begin_trace(trace.len())?;
        if let Err(err) = trace.iter().try_for_each(|span| self.encode_span(span)) {
            self.base.abort_trace(start);
            return Err(err);
        }
        Ok(self.base.finish_trace(start))
    }

    fn make_payload(&mut self) -> Vec<u8> {
        let traces = self.base.trace_bytes.as_slice();
        let mut payload = Vec::with_capacity(5 + traces.len());
        push_array_prefix(&mut payload, self.base.count_u32());
        payload.extend_from_slice(traces);
        self.base.reset();
        payload
    }
}
