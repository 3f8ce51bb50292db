// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace export pipeline for in-process tracers.
//!
//! Finished spans are handed to a [`trace_writer::TraceWriter`], which serializes them with a
//! [`encoder::TraceEncoder`] into one of the two agent wire formats (`v0.4` with inline strings, or
//! `v0.5` with a shared string table), decides when to flush, and ships the payload to the local
//! Datadog Agent through an [`agent_client::AgentClient`]. The agent's `rate_by_service` answer is
//! fed back into a [`sampler::RateByServiceSink`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent_client;
pub mod chunk;
pub mod config;
pub mod container;
pub mod encoder;
pub mod error;
pub mod http_utils;
pub mod sampler;
pub mod span;
pub mod trace_writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
