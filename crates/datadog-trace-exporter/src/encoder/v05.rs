// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `v0.5` encoding: a two element array holding the string table and the traces. Spans are fixed
//! arrays of twelve positional fields and every string is a reference into the table.
//!
//! The layout has no slot for `meta_struct` or native span events: the former is left out and
//! span events always travel as JSON under `meta.events`.

use crate::config::ProtocolVersion;
use crate::encoder::{
    checked_len, push_array_prefix, tokens, write_float, write_id, write_long, write_uint,
    EncoderBase, EncoderOptions, TraceEncoder,
};
use crate::error::EncodeError;
use crate::span::{Span, SPAN_EVENTS_TAG};

const SPAN_FIELDS: u8 = 12;

#[derive(Debug)]
pub struct V05Encoder {
    base: EncoderBase,
}

impl V05Encoder {
    pub fn new(options: EncoderOptions) -> Self {
        V05Encoder {
            base: EncoderBase::new(options),
        }
    }

    fn write_ref(&mut self, value: &str) -> Result<(), EncodeError> {
        let cached = self.base.strings.intern(value)?;
        write_uint(&mut self.base.trace_bytes, cached.id);
        Ok(())
    }

    fn encode_span(&mut self, span: &Span) -> Result<(), EncodeError> {
        self.base.trace_bytes.push(tokens::FIXARRAY | SPAN_FIELDS);
        self.write_ref(&span.service)?;
        self.write_ref(&span.name)?;
        self.write_ref(&span.resource)?;
        write_id(&mut self.base.trace_bytes, span.trace_id_low());
        write_id(&mut self.base.trace_bytes, span.span_id);
        write_id(&mut self.base.trace_bytes, span.parent_id().unwrap_or(0));
        write_long(&mut self.base.trace_bytes, span.start);
        write_long(&mut self.base.trace_bytes, span.duration);
        self.base
            .trace_bytes
            .extend_from_slice(tokens::uint(u16::from(span.has_error())));

        let meta = self.base.trace_bytes.placeholder_u32(tokens::MAP32);
        let mut entries = 0;
        for (key, value) in &span.meta {
            self.write_ref(key)?;
            self.write_ref(value)?;
            entries += 1;
        }
        for (key, value) in span.derived_meta() {
            self.write_ref(key)?;
            self.write_ref(&value)?;
            entries += 1;
        }
        if let Some(events) = span.span_events_json() {
            self.write_ref(SPAN_EVENTS_TAG)?;
            self.write_ref(&events)?;
            entries += 1;
        }
        self.base.trace_bytes.fill(meta, checked_len("map", entries)?);

        let metrics = self.base.trace_bytes.placeholder_u32(tokens::MAP32);
        let mut entries = 0;
        for (key, value) in span.encodable_metrics() {
            self.write_ref(key)?;
            write_float(&mut self.base.trace_bytes, value);
            entries += 1;
        }
        self.base
            .trace_bytes
            .fill(metrics, checked_len("map", entries)?);

        self.write_ref(span.span_type().unwrap_or_default())
    }
}

impl TraceEncoder for V05Encoder {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::V05
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
        let strings = self.base.strings.bytes().as_slice();
        let traces = self.base.trace_bytes.as_slice();
        let mut payload = Vec::with_capacity(1 + 5 + strings.len() + 5 + traces.len());
        payload.push(tokens::FIXARRAY | 2);
        push_array_prefix(&mut payload, self.base.strings.table_len());
        payload.extend_from_slice(strings);
        push_array_prefix(&mut payload, self.base.count_u32());
        payload.extend_from_slice(traces);
        self.base.reset();
        payload
    }
}
