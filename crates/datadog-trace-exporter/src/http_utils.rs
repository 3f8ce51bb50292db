// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use tracing::debug;

use crate::config::TracerMetadata;

pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";
pub const CONTAINER_ID_HEADER: &str = "datadog-container-id";
pub const LANG_HEADER: &str = "datadog-meta-lang";
pub const LANG_VERSION_HEADER: &str = "datadog-meta-lang-version";
pub const LANG_INTERPRETER_HEADER: &str = "datadog-meta-lang-interpreter";
pub const TRACER_VERSION_HEADER: &str = "datadog-meta-tracer-version";
pub const TRACE_COUNT_HEADER: &str = "x-datadog-trace-count";

/// Builds a reqwest client whose requests are aborted after `timeout`.
/// Uses rustls TLS.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

/// Joins the agent base url and an endpoint path without doubling the slash.
pub fn agent_endpoint(agent_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        agent_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Headers sent with every trace payload.
///
/// Values that are not valid header values are left out rather than failing the request.
pub fn trace_headers(
    metadata: &TracerMetadata,
    container_id: Option<&str>,
    trace_count: usize,
    content_length: usize,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(MSGPACK_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(TRACE_COUNT_HEADER, HeaderValue::from(trace_count));

    let optional = [
        (CONTAINER_ID_HEADER, container_id),
        (LANG_HEADER, Some(metadata.language.as_str())),
        (LANG_VERSION_HEADER, Some(metadata.language_version.as_str())),
        (
            LANG_INTERPRETER_HEADER,
            Some(metadata.language_interpreter.as_str()),
        ),
        (TRACER_VERSION_HEADER, Some(metadata.tracer_version.as_str())),
    ];
    for (name, value) in optional {
        let Some(value) = value.filter(|value| !value.is_empty()) else {
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => debug!("Skipping header {name} with invalid value {value:?}"),
        }
    }
    headers
}
