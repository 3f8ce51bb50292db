// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::agent_client::{AgentResponse, SendRequest, TraceTransport};
use crate::config::{Config, FlushInterval, ProtocolVersion};
use crate::encoder::{new_encoder, EncoderOptions, TraceEncoder};
use crate::error::{ClientError, ConfigError};
use crate::span::Span;

/// Statuses with which an agent tells it has no v0.5 endpoint.
const DOWNGRADE_STATUSES: [u16; 3] = [404, 415, 501];

pub type FlushResult = Result<Option<AgentResponse>, ClientError>;

/// Batches traces into payloads and hands them to a [`TraceTransport`].
///
/// `add` only ever appends to the live encoder and never waits on the network. Payloads are sent
/// on background tasks of the runtime the writer was created on, either when the flush interval
/// elapses, when the encoder reports its soft limit, or on an explicit [`TraceWriter::flush`].
/// Cloning the writer shares the same encoder. The last clone to be dropped sends whatever is
/// still buffered and blocks until the agent answers or the request timeout elapses, so the
/// traces survive the runtime shutting down right after.
#[derive(Clone)]
pub struct TraceWriter {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<WriterState>,
    transport: Arc<dyn TraceTransport>,
    flush_interval: FlushInterval,
    protocol_downgrade: bool,
    encoder_options: EncoderOptions,
    request_timeout: Duration,
    runtime: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

struct WriterState {
    encoder: Box<dyn TraceEncoder>,
    /// Protocol to switch to as soon as the current encoder has been drained.
    pending_protocol: Option<ProtocolVersion>,
    timer_armed: bool,
}

impl TraceWriter {
    /// Must be called from within a Tokio runtime, which then runs every flush.
    pub fn new(config: &Config, transport: Arc<dyn TraceTransport>) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let encoder_options = EncoderOptions::from(config);
        let encoder = new_encoder(config.protocol_version, encoder_options);
        Ok(TraceWriter {
            inner: Arc::new(Inner {
                state: Mutex::new(WriterState {
                    encoder,
                    pending_protocol: None,
                    timer_armed: false,
                }),
                transport,
                flush_interval: config.flush_interval,
                protocol_downgrade: config.protocol_downgrade,
                encoder_options,
                request_timeout: config.request_timeout,
                runtime,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Encodes one finished trace. Empty traces are ignored, and traces that cannot be encoded
    /// are dropped with a warning.
    pub fn add(&self, trace: &[Span]) {
        if trace.is_empty() {
            return;
        }
        let mut state = self.inner.lock_state();
        let soft_limit_reached = match state.encoder.encode(trace) {
            Ok(soft_limit_reached) => soft_limit_reached,
            Err(e) => {
                warn!("Dropping trace of {} spans: {e}", trace.len());
                return;
            }
        };

        match self.inner.flush_interval {
            FlushInterval::Immediate => {
                self.inner.flush_locked(&mut state);
            }
            _ if soft_limit_reached => {
                debug!("Payload soft limit reached, flushing {} traces", state.encoder.count());
                self.inner.flush_locked(&mut state);
            }
            FlushInterval::Every(interval) => {
                if !state.timer_armed {
                    state.timer_armed = true;
                    self.inner.arm_timer(interval);
                }
            }
            FlushInterval::Manual => {}
        }
    }

    /// Sends every buffered trace. Returns `None`, without any request, when nothing is buffered.
    ///
    /// The returned handle resolves once the agent has answered; dropping it does not cancel the
    /// request.
    pub fn flush(&self) -> Option<JoinHandle<FlushResult>> {
        let mut state = self.inner.lock_state();
        self.inner.flush_locked(&mut state)
    }

    /// Number of traces waiting for the next flush.
    pub fn count(&self) -> usize {
        self.inner.lock_state().encoder.count()
    }

    /// Protocol of the payload currently being built.
    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.lock_state().encoder.protocol()
    }

    /// Stops the flush timer, sends what is buffered and waits for every in-flight request.
    ///
    /// Traces added afterwards are only sent by an explicit flush or when the writer is dropped.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let _ = self.flush();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_locked(self: &Arc<Self>, state: &mut WriterState) -> Option<JoinHandle<FlushResult>> {
        let trace_count = state.encoder.count();
        if trace_count == 0 {
            debug!("No traces to flush");
            return None;
        }

        let request = SendRequest {
            protocol: state.encoder.protocol(),
            payload: state.encoder.make_payload(),
            trace_count,
        };
        if let Some(protocol) = state.pending_protocol.take() {
            state.encoder = self.encoder_for(protocol);
        }
        debug!(
            "Flushing {trace_count} traces ({} bytes)",
            request.payload.len()
        );
        Some(self.spawn_send(request))
    }

    fn spawn_send(self: &Arc<Self>, request: SendRequest) -> JoinHandle<FlushResult> {
        let transport = Arc::clone(&self.transport);
        let writer = Arc::downgrade(self);
        self.tracker.spawn_on(
            async move {
                let protocol = request.protocol;
                let result = transport.send(request).await;
                if let (Err(err), Some(writer)) = (&result, writer.upgrade()) {
                    writer.on_send_error(protocol, err);
                }
                result
            },
            &self.runtime,
        )
    }

    fn arm_timer(self: &Arc<Self>, interval: Duration) {
        let writer = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(interval) => {
                        if let Some(writer) = writer.upgrade() {
                            let mut state = writer.lock_state();
                            state.timer_armed = false;
                            let _ = writer.flush_locked(&mut state);
                        }
                    }
                }
            },
            &self.runtime,
        );
    }

    fn on_send_error(&self, protocol: ProtocolVersion, err: &ClientError) {
        if !self.protocol_downgrade || protocol != ProtocolVersion::V05 {
            return;
        }
        let Some(status) = err.status().filter(|s| DOWNGRADE_STATUSES.contains(s)) else {
            return;
        };

        let mut state = self.lock_state();
        if state.encoder.protocol() == ProtocolVersion::V04
            || state.pending_protocol == Some(ProtocolVersion::V04)
        {
            return;
        }
        debug!("Agent answered v0.5 traces with status {status}, switching to v0.4");
        if state.encoder.count() == 0 {
            state.encoder = self.encoder_for(ProtocolVersion::V04);
        } else {
            state.pending_protocol = Some(ProtocolVersion::V04);
        }
    }

    fn encoder_for(&self, protocol: ProtocolVersion) -> Box<dyn TraceEncoder> {
        new_encoder(protocol, self.encoder_options)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let trace_count = state.encoder.count();
        if trace_count == 0 {
            return;
        }
        debug!("Flushing {trace_count} traces before the writer goes away");
        let request = SendRequest {
            protocol: state.encoder.protocol(),
            payload: state.encoder.make_payload(),
            trace_count,
        };

        // The writer's runtime may be shutting down and cannot be relied on to run the request.
        let transport = Arc::clone(&self.transport);
        let timeout = self.request_timeout;
        let flush = thread::Builder::new()
            .name("dd-trace-final-flush".to_string())
            .spawn(move || send_final(transport, request, timeout));
        match flush {
            Ok(handle) => {
                if handle.join().is_err() {
                    warn!("Final trace flush panicked");
                }
            }
            Err(e) => warn!("Failed to start the final trace flush: {e}"),
        }
    }
}

fn send_final(transport: Arc<dyn TraceTransport>, request: SendRequest, timeout: Duration) {
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Failed to build a runtime for the final trace flush: {e}");
            return;
        }
    };
    let trace_count = request.trace_count;
    match runtime.block_on(tokio::time::timeout(timeout, transport.send_final(request))) {
        Ok(Ok(_)) => debug!("Final flush of {trace_count} traces done"),
        // already reported by the transport
        Ok(Err(_)) => {}
        Err(_) => warn!("Final flush of {trace_count} traces timed out after {timeout:?}"),
    }
}
