//! Outbound calls to inference backends.
//!
//! `BackendClient` is the seam between the dispatcher and the network; the
//! HTTP implementation speaks the OpenAI chat completions protocol.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use llm_gateway_common::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Usage};
use reqwest::Client;
use thiserror::Error;

use super::registry::Backend;
use super::sse::{SseDecoder, SseFrame};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Ways a single backend call can fail.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("backend timed out: {0}")]
    Timeout(String),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend sent an invalid response: {0}")]
    InvalidResponse(String),
    #[error("backend stream interrupted: {0}")]
    Interrupted(String),
}

impl BackendError {
    /// Whether another backend might succeed where this one failed.
    ///
    /// Client errors other than 429 would fail the same way everywhere.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => true,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// One item of a backend's event stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A chunk, kept as the raw JSON the backend sent.
    Chunk {
        data: String,
        usage: Option<Usage>,
        finished: bool,
    },
    /// The backend finished the stream cleanly.
    Done,
}

pub type ChunkStream = BoxStream<'static, Result<StreamFrame, BackendError>>;

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Run a non-streaming completion.
    async fn chat_completion(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BackendError>;

    /// Open a streaming completion. Resolves once response headers arrive.
    async fn chat_completion_stream(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError>;
}

/// `BackendClient` over HTTP.
#[derive(Clone)]
pub struct HttpBackendClient {
    http_client: Client,
}

impl HttpBackendClient {
    /// Total request time is bounded by the dispatcher, not here; a stream may
    /// legitimately run for minutes.
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http_client })
    }

    async fn post(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}{}", backend.base_url, CHAT_COMPLETIONS_PATH);
        tracing::debug!("Proxying request to {} (backend: {})", url, backend.id);

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(BackendError::from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn chat_completion(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BackendError> {
        let mut request = request.clone();
        request.stream = Some(false);

        let body = self
            .post(backend, &request)
            .await?
            .bytes()
            .await
            .map_err(BackendError::from_reqwest)?;

        serde_json::from_slice(&body).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    async fn chat_completion_stream(
        &self,
        backend: &Backend,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError> {
        let mut request = request.clone();
        request.stream = Some(true);

        let response = self.post(backend, &request).await?;
        Ok(decode_event_stream(response.bytes_stream().boxed()))
    }
}

struct EventStreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<SseFrame>,
    saw_finish: bool,
    eof: bool,
    ended: bool,
}

/// Turn a raw SSE body into frames.
///
/// The stream always terminates with either `Done` or exactly one error. A
/// body that ends without `[DONE]` counts as complete only if some chunk
/// carried a `finish_reason`.
fn decode_event_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ChunkStream {
    let state = EventStreamState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        saw_finish: false,
        eof: false,
        ended: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.ended {
                return None;
            }

            if let Some(frame) = state.pending.pop_front() {
                let item = match frame {
                    SseFrame::Done => Ok(StreamFrame::Done),
                    SseFrame::Data(data) => parse_chunk(data),
                };
                match &item {
                    Ok(StreamFrame::Done) | Err(_) => state.ended = true,
                    Ok(StreamFrame::Chunk { finished, .. }) => state.saw_finish |= *finished,
                }
                return Some((item, state));
            }

            if state.eof {
                state.ended = true;
                let end = if state.saw_finish {
                    Ok(StreamFrame::Done)
                } else {
                    Err(BackendError::Interrupted(
                        "stream ended before completion".to_string(),
                    ))
                };
                return Some((end, state));
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let frames = state.decoder.push(&bytes);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    state.ended = true;
                    return Some((Err(BackendError::Interrupted(e.to_string())), state));
                }
                None => {
                    state.eof = true;
                    if let Some(frame) = state.decoder.finish() {
                        state.pending.push_back(frame);
                    }
                }
            }
        }
    })
    .boxed()
}

fn parse_chunk(data: String) -> Result<StreamFrame, BackendError> {
    let value: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

    // Some servers report failures in-band as an `error` event.
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(BackendError::Interrupted(message));
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_value(value).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    let finished = chunk.choices.iter().any(|c| c.finish_reason.is_some());

    Ok(StreamFrame::Chunk {
        data,
        usage: chunk.usage,
        finished,
    })
}
