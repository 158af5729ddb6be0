//! Sends requests to backends with bounded failover, and relays streams.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use llm_gateway_common::{ChatCompletionRequest, ChatCompletionResponse, Usage};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::client::{BackendClient, BackendError, ChunkStream, StreamFrame};
use super::context::RequestContext;
use super::health::{HealthSample, HealthTracker, LoadGuard};
use super::registry::Backend;
use super::router::LeastBusyRouter;
use crate::config::DispatchConfig;
use crate::error::GatewayError;

/// What a successful dispatch hands back to the HTTP layer.
pub enum Dispatched {
    Complete {
        response: ChatCompletionResponse,
        backend_id: String,
    },
    Stream(RelayStream),
}

/// Receiving end of a relayed backend stream.
///
/// Dropping it cancels the backend read and releases the backend's load.
pub struct RelayStream {
    pub backend_id: String,
    pub events: mpsc::Receiver<RelayEvent>,
}

/// One event on a relayed stream, in backend order.
///
/// A stream always ends with exactly one `Done` or `Interrupted`.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Raw chunk JSON as sent by the backend.
    Chunk(String),
    Done { usage: Option<Usage> },
    Interrupted(GatewayError),
}

enum Attempt {
    Complete(ChatCompletionResponse),
    Stream(ChunkStream, StreamFrame),
}

/// Forwards requests to the least busy backend, failing over on retryable errors.
pub struct Dispatcher {
    router: LeastBusyRouter,
    tracker: Arc<HealthTracker>,
    client: Arc<dyn BackendClient>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        router: LeastBusyRouter,
        tracker: Arc<HealthTracker>,
        client: Arc<dyn BackendClient>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            router,
            tracker,
            client,
            config,
        }
    }

    /// Dispatch an authenticated request.
    ///
    /// Each attempt goes to a backend this request has not tried yet. Failover
    /// stops at `max_attempts`, when the candidates run out, or when the
    /// overall deadline passes. For streams, the deadline only covers the
    /// attempts; once the first chunk arrives the stream runs to completion.
    pub async fn dispatch(
        &self,
        mut ctx: RequestContext,
        request: &ChatCompletionRequest,
    ) -> Result<Dispatched, GatewayError> {
        let deadline = Instant::now() + self.config.request_timeout();
        let mut last_error: Option<BackendError> = None;
        let mut all_timed_out = true;
        let mut deadline_expired = false;

        while ctx.attempts < self.config.max_attempts {
            let backend = match self.router.select_excluding(&ctx.model, &ctx.tried).await {
                Ok(backend) => backend,
                Err(err) if ctx.attempts == 0 => return Err(ctx.fail(err.into())),
                // Every eligible backend has been tried.
                Err(_) => break,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                deadline_expired = true;
                break;
            }
            let budget = self.config.attempt_timeout().min(remaining);

            ctx.route_to(&backend.id);
            ctx.begin_attempt();
            let guard = self.tracker.begin_dispatch(&backend);
            let started = Instant::now();

            match self.attempt(&backend, request, ctx.stream, budget).await {
                Ok(Attempt::Complete(response)) => {
                    self.tracker
                        .record(&backend, HealthSample::success(started.elapsed()));
                    drop(guard);
                    ctx.complete();
                    tracing::debug!(
                        request_id = %ctx.id,
                        "Completed on {} after {} attempt(s)",
                        backend.id,
                        ctx.attempts
                    );
                    return Ok(Dispatched::Complete {
                        response,
                        backend_id: backend.id.clone(),
                    });
                }
                Ok(Attempt::Stream(stream, first)) => {
                    self.tracker
                        .record(&backend, HealthSample::success(started.elapsed()));
                    ctx.start_streaming();

                    let (tx, rx) = mpsc::channel(self.config.stream_buffer);
                    let backend_id = backend.id.clone();
                    let tracker = self.tracker.clone();
                    tokio::spawn(relay(ctx, backend, tracker, guard, stream, first, tx));

                    return Ok(Dispatched::Stream(RelayStream {
                        backend_id,
                        events: rx,
                    }));
                }
                Err(err) => {
                    drop(guard);

                    if let BackendError::Status { status, body } = &err {
                        if !err.is_retryable() {
                            return Err(ctx.fail(GatewayError::BackendRejected {
                                status: *status,
                                message: body.clone(),
                            }));
                        }
                    }

                    let sample = if err.is_timeout() {
                        HealthSample::timeout(started.elapsed())
                    } else {
                        HealthSample::failure(started.elapsed())
                    };
                    self.tracker.record(&backend, sample);
                    tracing::warn!(
                        request_id = %ctx.id,
                        attempt = ctx.attempts,
                        "Attempt on backend {} failed: {}",
                        backend.id,
                        err
                    );

                    all_timed_out &= err.is_timeout();
                    last_error = Some(err);

                    if ctx.attempts < self.config.max_attempts {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let delay = self.config.backoff.delay(ctx.attempts).min(remaining);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let deadline_expired = deadline_expired || Instant::now() >= deadline;
        let attempts = ctx.attempts;
        let err = match last_error {
            _ if deadline_expired => GatewayError::UpstreamTimeout { attempts },
            Some(_) if all_timed_out => GatewayError::UpstreamTimeout { attempts },
            Some(err) => GatewayError::UpstreamUnavailable {
                attempts,
                last_error: err.to_string(),
            },
            None => GatewayError::NoHealthyBackend(ctx.model.clone()),
        };
        Err(ctx.fail(err))
    }

    /// One attempt, bounded by `budget` up to the first byte or chunk.
    async fn attempt(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
        stream: bool,
        budget: Duration,
    ) -> Result<Attempt, BackendError> {
        let result = if stream {
            timeout(budget, self.open_stream(backend, request)).await
        } else {
            timeout(budget, self.client.chat_completion(backend, request))
                .await
                .map(|r| r.map(Attempt::Complete))
        };

        result.unwrap_or_else(|_| {
            Err(BackendError::Timeout(format!(
                "no response within {}ms",
                budget.as_millis()
            )))
        })
    }

    async fn open_stream(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
    ) -> Result<Attempt, BackendError> {
        let mut chunks = self.client.chat_completion_stream(backend, request).await?;
        match chunks.next().await {
            Some(Ok(first)) => Ok(Attempt::Stream(chunks, first)),
            Some(Err(err)) => Err(err),
            None => Err(BackendError::Interrupted(
                "stream closed before the first chunk".to_string(),
            )),
        }
    }
}

/// Copy backend frames to the client channel until the stream ends.
///
/// Owns the load guard, so load is released however the relay ends,
/// including when the client goes away.
async fn relay(
    mut ctx: RequestContext,
    backend: Arc<Backend>,
    tracker: Arc<HealthTracker>,
    _guard: LoadGuard,
    mut stream: ChunkStream,
    first: StreamFrame,
    tx: mpsc::Sender<RelayEvent>,
) {
    let started = Instant::now();
    let mut usage: Option<Usage> = None;
    let mut next = Some(Ok(first));

    loop {
        let item = match next.take() {
            Some(item) => Some(item),
            None => tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(request_id = %ctx.id, "Client disconnected, dropping stream");
                    ctx.close();
                    return;
                }
                item = stream.next() => item,
            },
        };

        let event = match item {
            Some(Ok(StreamFrame::Chunk { data, usage: seen, .. })) => {
                if seen.is_some() {
                    usage = seen;
                }
                RelayEvent::Chunk(data)
            }
            Some(Ok(StreamFrame::Done)) => {
                ctx.complete();
                let _ = tx.send(RelayEvent::Done { usage }).await;
                return;
            }
            Some(Err(err)) => {
                tracker.record(&backend, HealthSample::failure(started.elapsed()));
                let err = ctx.fail(GatewayError::StreamInterrupted(err.to_string()));
                let _ = tx.send(RelayEvent::Interrupted(err)).await;
                return;
            }
            None => {
                tracker.record(&backend, HealthSample::failure(started.elapsed()));
                let err = ctx.fail(GatewayError::StreamInterrupted(
                    "backend closed the stream without completing".to_string(),
                ));
                let _ = tx.send(RelayEvent::Interrupted(err)).await;
                return;
            }
        };

        if tx.send(event).await.is_err() {
            tracing::debug!(request_id = %ctx.id, "Client disconnected mid-stream");
            ctx.close();
            return;
        }
    }
}
