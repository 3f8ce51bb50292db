// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use datadog_trace_exporter::agent_client::AgentClient;
use datadog_trace_exporter::config::{Config, FlushInterval, ProtocolVersion};
use datadog_trace_exporter::sampler::PrioritySampler;
use datadog_trace_exporter::trace_writer::TraceWriter;
use tokio::time::{sleep, timeout};

use super::mock_server::{MockAgent, ReceivedRequest};

pub const TEST_CONTAINER_ID: &str =
    "3726184226f5d3147c25fdeab5b60097e378e8a720503a5e19ecfdf29f869860";

pub fn create_test_config(
    agent: &MockAgent,
    protocol_version: ProtocolVersion,
    flush_interval: FlushInterval,
) -> Config {
    Config {
        agent_url: agent.url(),
        protocol_version,
        flush_interval,
        container_id: Some(TEST_CONTAINER_ID.to_string()),
        ..Default::default()
    }
}

/// Writer wired to a real agent client that feeds the returned sampler
pub fn create_test_writer(config: &Config) -> (TraceWriter, Arc<PrioritySampler>) {
    let sampler = Arc::new(PrioritySampler::new());
    let client = AgentClient::new(config)
        .expect("Failed to create agent client")
        .with_sink(sampler.clone());
    let writer =
        TraceWriter::new(config, Arc::new(client)).expect("Failed to create trace writer");
    (writer, sampler)
}

/// Wait until the agent has received `count` requests on `path`
pub async fn wait_for_requests(
    agent: &MockAgent,
    path: &str,
    count: usize,
) -> Vec<ReceivedRequest> {
    let poll = async {
        loop {
            let requests = agent.get_requests_for_path(path);
            if requests.len() >= count {
                return requests;
            }
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), poll)
        .await
        .expect("timed out waiting for the agent to receive traces")
}
