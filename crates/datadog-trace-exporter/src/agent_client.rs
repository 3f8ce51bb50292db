// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(unix)]
use bytes::Bytes;
#[cfg(unix)]
use http_body_util::{BodyExt, Full};
#[cfg(unix)]
use hyper::header::{HeaderValue, HOST};
#[cfg(unix)]
use hyper_util::rt::TokioIo;
#[cfg(unix)]
use reqwest::header::HeaderMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::config::{Config, ProtocolVersion, TracerMetadata};
use crate::error::ClientError;
use crate::http_utils::{agent_endpoint, build_client, trace_headers};
use crate::sampler::{RateByService, RateByServiceSink};

/// Requests allowed in flight to one endpoint. Payloads past this are dropped.
pub const MAX_ACTIVE_REQUESTS_PER_ENDPOINT: usize = 8;

/// One finished payload on its way to the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub payload: Vec<u8>,
    pub protocol: ProtocolVersion,
    pub trace_count: usize,
}

impl SendRequest {
    pub fn path(&self) -> &'static str {
        self.protocol.path()
    }
}

/// Successful answer of the agent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentResponse {
    pub status: u16,
    pub rate_by_service: Option<RateByService>,
}

/// Ships payloads to the agent. Implementations must never panic on network failures; every
/// outcome is reported through the returned `Result`.
#[async_trait]
pub trait TraceTransport: Send + Sync {
    /// Sends one payload. Returns `Ok(None)` without touching the network when the request
    /// carries no traces, or when too many requests are already in flight.
    async fn send(&self, request: SendRequest) -> Result<Option<AgentResponse>, ClientError>;

    /// Sends the last payload of a writer that is going away.
    ///
    /// Runs on a short-lived runtime of its own, so implementations must not reuse I/O resources
    /// tied to the runtime the transport was created on.
    async fn send_final(&self, request: SendRequest) -> Result<Option<AgentResponse>, ClientError> {
        self.send(request).await
    }
}

/// How the agent is reached.
enum AgentConnection {
    Tcp {
        client: reqwest::Client,
        agent_url: String,
    },
    #[cfg(unix)]
    Unix { socket: PathBuf },
}

impl AgentConnection {
    fn endpoint(&self, path: &str) -> String {
        match self {
            AgentConnection::Tcp { agent_url, .. } => agent_endpoint(agent_url, path),
            #[cfg(unix)]
            AgentConnection::Unix { socket } => format!("unix://{}{path}", socket.display()),
        }
    }

    /// Same agent, with none of the pooled connections.
    fn reopen(&self, timeout: Duration) -> Result<Self, ClientError> {
        Ok(match self {
            AgentConnection::Tcp { agent_url, .. } => AgentConnection::Tcp {
                client: build_client(timeout)?,
                agent_url: agent_url.clone(),
            },
            #[cfg(unix)]
            AgentConnection::Unix { socket } => AgentConnection::Unix {
                socket: socket.clone(),
            },
        })
    }
}

pub struct AgentClient {
    connection: AgentConnection,
    request_timeout: Duration,
    metadata: TracerMetadata,
    container_id: Option<String>,
    sink: Option<Arc<dyn RateByServiceSink>>,
    v04_requests: Semaphore,
    v05_requests: Semaphore,
}

impl AgentClient {
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        let connection = match config.agent_socket() {
            #[cfg(unix)]
            Some(socket) => AgentConnection::Unix {
                socket: socket.to_path_buf(),
            },
            #[cfg(not(unix))]
            Some(_) => return Err(ClientError::InvalidUrl(config.agent_url.clone())),
            None => {
                reqwest::Url::parse(&agent_endpoint(
                    &config.agent_url,
                    config.protocol_version.path(),
                ))
                .map_err(|_| ClientError::InvalidUrl(config.agent_url.clone()))?;
                AgentConnection::Tcp {
                    client: build_client(config.request_timeout)?,
                    agent_url: config.agent_url.clone(),
                }
            }
        };

        Ok(AgentClient {
            connection,
            request_timeout: config.request_timeout,
            metadata: config.metadata.clone(),
            container_id: config.container_id.clone(),
            sink: None,
            v04_requests: Semaphore::new(MAX_ACTIVE_REQUESTS_PER_ENDPOINT),
            v05_requests: Semaphore::new(MAX_ACTIVE_REQUESTS_PER_ENDPOINT),
        })
    }

    /// Hands every received `rate_by_service` table to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RateByServiceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn active_requests(&self, protocol: ProtocolVersion) -> &Semaphore {
        match protocol {
            ProtocolVersion::V04 => &self.v04_requests,
            ProtocolVersion::V05 => &self.v05_requests,
        }
    }

    fn try_start_request(&self, protocol: ProtocolVersion) -> Option<SemaphorePermit<'_>> {
        let permit = self.active_requests(protocol).try_acquire().ok();
        if permit.is_none() {
            debug!(
                "Maximum number of active requests reached for endpoint {}. Payload discarded.",
                self.connection.endpoint(protocol.path())
            );
        }
        permit
    }

    async fn put(
        &self,
        connection: &AgentConnection,
        request: SendRequest,
    ) -> Result<AgentResponse, ClientError> {
        let endpoint = connection.endpoint(request.path());
        let headers = trace_headers(
            &self.metadata,
            self.container_id.as_deref(),
            request.trace_count,
            request.payload.len(),
        );
        debug!(
            "Sending {} traces ({} bytes) to {endpoint}",
            request.trace_count,
            request.payload.len()
        );

        let (status, body) = match connection {
            AgentConnection::Tcp { client, .. } => {
                let response = client
                    .put(&endpoint)
                    .headers(headers)
                    .body(request.payload)
                    .send()
                    .await?;
                let status = response.status().as_u16();
                (status, response.text().await?)
            }
            #[cfg(unix)]
            AgentConnection::Unix { socket } => tokio::time::timeout(
                self.request_timeout,
                put_unix(socket, request.path(), headers, request.payload),
            )
            .await
            .map_err(|_| ClientError::Timeout(self.request_timeout))??,
        };
        if !(200..300).contains(&status) {
            return Err(ClientError::Status { status, body });
        }

        let rate_by_service = parse_rate_by_service(&body)?;
        if let (Some(sink), Some(rates)) = (&self.sink, &rate_by_service) {
            sink.update(rates.clone());
        }
        debug!("Successfully flushed {} traces", request.trace_count);
        Ok(AgentResponse {
            status,
            rate_by_service,
        })
    }
}

/// One HTTP/1.1 exchange over a fresh connection to the agent socket.
#[cfg(unix)]
async fn put_unix(
    socket: &Path,
    path: &str,
    headers: HeaderMap,
    payload: Vec<u8>,
) -> Result<(u16, String), ClientError> {
    let stream = UnixStream::connect(socket).await?;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Agent socket connection failed: {e}");
        }
    });

    let mut request = hyper::Request::put(path)
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    *request.headers_mut() = headers;
    request
        .headers_mut()
        .insert(HOST, HeaderValue::from_static("localhost"));

    let response = sender.send_request(request).await?;
    let status = response.status().as_u16();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

#[async_trait]
impl TraceTransport for AgentClient {
    async fn send(&self, request: SendRequest) -> Result<Option<AgentResponse>, ClientError> {
        if request.trace_count == 0 {
            debug!("No traces to send, skipping request");
            return Ok(None);
        }
        let Some(_permit) = self.try_start_request(request.protocol) else {
            return Ok(None);
        };
        self.put(&self.connection, request)
            .await
            .map(Some)
            .inspect_err(|e| warn!("Error sending traces to the agent: {e}"))
    }

    async fn send_final(&self, request: SendRequest) -> Result<Option<AgentResponse>, ClientError> {
        if request.trace_count == 0 {
            return Ok(None);
        }
        // pooled connections belong to the runtime that opened them
        let connection = self.connection.reopen(self.request_timeout)?;
        self.put(&connection, request)
            .await
            .map(Some)
            .inspect_err(|e| warn!("Error sending final traces to the agent: {e}"))
    }
}

#[derive(Deserialize)]
struct RawAgentResponse {
    #[serde(default, deserialize_with = "deserialize_rates")]
    rate_by_service: Option<RateByService>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRate {
    Number(f64),
    Text(String),
}

fn deserialize_rates<'de, D>(deserializer: D) -> Result<Option<RateByService>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<String, RawRate>>::deserialize(deserializer)?;
    raw.map(|rates| {
        rates
            .into_iter()
            .map(|(key, rate)| match rate {
                RawRate::Number(rate) => Ok((key, rate)),
                RawRate::Text(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(|rate| (key, rate))
                    .map_err(|_| D::Error::custom(format!("invalid sampling rate {text:?}"))),
            })
            .collect::<Result<RateByService, D::Error>>()
    })
    .transpose()
}

/// Extracts `rate_by_service` from an agent response body. An empty body carries no rates.
pub fn parse_rate_by_service(body: &str) -> Result<Option<RateByService>, ClientError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let response: RawAgentResponse = serde_json::from_str(body)?;
    Ok(response.rate_by_service)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::{Matcher, Server};
    use tracing_test::traced_test;

    use super::*;
    use crate::encoder::{new_encoder, EncoderOptions};
    use crate::sampler::PrioritySampler;
    use crate::test_utils::create_test_trace;

    fn config(agent_url: String) -> Config {
        Config {
            agent_url,
            container_id: Some("abc123def456".to_string()),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn request(protocol: ProtocolVersion) -> SendRequest {
        let mut encoder = new_encoder(protocol, EncoderOptions::default());
        encoder.encode(&create_test_trace(1, 2)).unwrap();
        SendRequest {
            trace_count: encoder.count(),
            payload: encoder.make_payload(),
            protocol,
        }
    }

    #[tokio::test]
    async fn test_sends_payload_with_headers() {
        let mut server = Server::new_async().await;
        let request = request(ProtocolVersion::V04);
        let mock = server
            .mock("PUT", "/v0.4/traces")
            .match_header("content-type", "application/msgpack")
            .match_header(
                "content-length",
                Matcher::Exact(request.payload.len().to_string()),
            )
            .match_header("x-datadog-trace-count", "1")
            .match_header("datadog-container-id", "abc123def456")
            .match_header("datadog-meta-lang", "rust")
            .match_header("datadog-meta-lang-interpreter", "rustc")
            .match_header("datadog-meta-tracer-version", env!("CARGO_PKG_VERSION"))
            .with_status(200)
            .with_body(r#"{"rate_by_service":{"service:,env:":1}}"#)
            .create_async()
            .await;

        let client = AgentClient::new(&config(server.url())).unwrap();
        let response = client.send(request).await.unwrap().unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.rate_by_service,
            Some(HashMap::from([("service:,env:".to_string(), 1.0)]))
        );
        // the request slot is given back once the agent answered
        assert_eq!(
            client
                .active_requests(ProtocolVersion::V04)
                .available_permits(),
            MAX_ACTIVE_REQUESTS_PER_ENDPOINT
        );
    }

    #[tokio::test]
    async fn test_v05_uses_its_own_path() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v0.5/traces")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = AgentClient::new(&config(server.url())).unwrap();
        let response = client
            .send(request(ProtocolVersion::V05))
            .await
            .unwrap()
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.rate_by_service, None);
    }

    #[tokio::test]
    async fn test_zero_count_skips_network() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = AgentClient::new(&config(server.url())).unwrap();
        let response = client
            .send(SendRequest {
                payload: vec![0xdd, 0, 0, 0, 0],
                protocol: ProtocolVersion::V04,
                trace_count: 0,
            })
            .await
            .unwrap();

        assert_eq!(response, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_error_status_leaves_rates_untouched() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v0.4/traces")
            .with_status(429)
            .with_body("Too Many Requests")
            .create_async()
            .await;

        let sampler = Arc::new(PrioritySampler::new());
        sampler.update(HashMap::from([("service:a,env:b".to_string(), 0.7)]));
        let client = AgentClient::new(&config(server.url()))
            .unwrap()
            .with_sink(sampler.clone());

        let err = client
            .send(request(ProtocolVersion::V04))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(429));
        assert_eq!(
            sampler.rates(),
            HashMap::from([("service:a,env:b".to_string(), 0.7)])
        );
        assert!(logs_contain("agent responded with status 429"));
    }

    #[tokio::test]
    async fn test_rates_replace_previous_table() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v0.4/traces")
            .with_status(200)
            .with_body(r#"{"rate_by_service":{"svc,env":"0.5"}}"#)
            .create_async()
            .await;

        let sampler = Arc::new(PrioritySampler::new());
        sampler.update(HashMap::from([
            ("old,env".to_string(), 0.1),
            ("svc,env".to_string(), 0.9),
        ]));
        let client = AgentClient::new(&config(server.url()))
            .unwrap()
            .with_sink(sampler.clone());

        client
            .send(request(ProtocolVersion::V04))
            .await
            .unwrap();

        assert_eq!(
            sampler.rates(),
            HashMap::from([("svc,env".to_string(), 0.5)])
        );
    }

    #[tokio::test]
    async fn test_malformed_json_is_an_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("PUT", "/v0.4/traces")
            .with_status(200)
            .with_body("{not json")
            .create_async()
            .await;

        let sampler = Arc::new(PrioritySampler::new());
        let client = AgentClient::new(&config(server.url()))
            .unwrap()
            .with_sink(sampler.clone());

        let err = client
            .send(request(ProtocolVersion::V04))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Decode(_)));
        assert!(sampler.rates().is_empty());
    }

    #[tokio::test]
    async fn test_connection_refused_is_reported() {
        // nothing listens on port 1
        let client = AgentClient::new(&config("http://127.0.0.1:1".to_string())).unwrap();
        let err = client
            .send(request(ProtocolVersion::V04))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_invalid_agent_url() {
        let result = AgentClient::new(&config("not a url".to_string()));
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_parse_rate_by_service() {
        assert_eq!(parse_rate_by_service("").unwrap(), None);
        assert_eq!(parse_rate_by_service("{}").unwrap(), None);
        assert_eq!(
            parse_rate_by_service(r#"{"rate_by_service":{"a":0.25,"b":"1"}}"#).unwrap(),
            Some(HashMap::from([
                ("a".to_string(), 0.25),
                ("b".to_string(), 1.0)
            ]))
        );
        assert!(parse_rate_by_service(r#"{"rate_by_service":{"a":"high"}}"#).is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_requests_past_the_endpoint_cap_are_dropped() {
        let mut server = Server::new_async().await;
        let v04 = server
            .mock("PUT", "/v0.4/traces")
            .expect(0)
            .create_async()
            .await;
        let v05 = server
            .mock("PUT", "/v0.5/traces")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = AgentClient::new(&config(server.url())).unwrap();
        let _in_flight = client
            .active_requests(ProtocolVersion::V04)
            .try_acquire_many(MAX_ACTIVE_REQUESTS_PER_ENDPOINT as u32)
            .unwrap();

        let response = client.send(request(ProtocolVersion::V04)).await.unwrap();
        assert_eq!(response, None);
        v04.assert_async().await;
        assert!(logs_contain(&format!(
            "Maximum number of active requests reached for endpoint {}/v0.4/traces. Payload discarded.",
            server.url()
        )));

        // every endpoint has its own budget
        let response = client.send(request(ProtocolVersion::V05)).await.unwrap();
        assert_eq!(response.map(|r| r.status), Some(200));
        v05.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_final_uses_fresh_connections() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/v0.4/traces")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let client = AgentClient::new(&config(server.url())).unwrap();
        let request = request(ProtocolVersion::V04);
        let response = std::thread::spawn(move || {
            // a runtime other than the one the client was built on
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(client.send_final(request))
        })
        .join()
        .unwrap()
        .unwrap();

        assert_eq!(response.map(|r| r.status), Some(200));
        mock.assert_async().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sends_payload_over_unix_socket() {
        use hyper::body::Incoming;
        use hyper::service::service_fn;
        use tokio::net::UnixListener;
        use tokio::sync::mpsc::unbounded_channel;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("apm.socket");
        let listener = UnixListener::bind(&socket).unwrap();
        let (received_tx, mut received) = unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let received_tx = received_tx.clone();
                async move {
                    let path = req.uri().path().to_string();
                    let trace_count = req
                        .headers()
                        .get("x-datadog-trace-count")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    let body = req.into_body().collect().await?.to_bytes();
                    let _ = received_tx.send((path, trace_count, body.to_vec()));
                    Ok::<_, hyper::Error>(hyper::Response::new(Full::new(Bytes::from(
                        r#"{"rate_by_service":{"service:,env:":0.5}}"#,
                    ))))
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let config = config(format!("unix://{}", socket.display()));
        let sampler = Arc::new(PrioritySampler::new());
        let client = AgentClient::new(&config)
            .unwrap()
            .with_sink(sampler.clone());
        let request = request(ProtocolVersion::V05);
        let payload = request.payload.clone();

        let response = client.send(request).await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(sampler.rate_for("", ""), 0.5);

        let (path, trace_count, body) = received.recv().await.unwrap();
        assert_eq!(path, "/v0.5/traces");
        assert_eq!(trace_count.as_deref(), Some("1"));
        assert_eq!(body, payload);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_unix_socket_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("missing.socket");
        let client =
            AgentClient::new(&config(format!("unix://{}", socket.display()))).unwrap();

        let err = client
            .send(request(ProtocolVersion::V04))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Socket(_)));
        assert_eq!(err.status(), None);
    }
}
