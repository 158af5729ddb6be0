pub mod mock_backend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use llm_gateway_common::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};

use crate::config::{ApiKeyConfig, BackendConfig, BackoffConfig, Config, DispatchConfig};
use crate::gateway::{Backend, BackendClient, BackendError, ChunkStream, StreamFrame};
use crate::AppState;

pub const TEST_MODEL: &str = "llama3-8b";
pub const TEST_API_KEY: &str = "sk-test";

/// Config with one key (`sk-test`, 10 rpm) and the given backends, all serving `llama3-8b`.
pub fn test_config(backend_ports: &[u16]) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.logging.level = "debug".to_string();
    config.backends = backend_ports
        .iter()
        .map(|port| BackendConfig {
            host: "127.0.0.1".to_string(),
            port: *port,
            scheme: "http".to_string(),
            models: vec![TEST_MODEL.to_string()],
        })
        .collect();
    config.auth.keys = vec![ApiKeyConfig {
        name: "test".to_string(),
        key: TEST_API_KEY.to_string(),
        requests_per_minute: 10,
        tokens_per_minute: None,
    }];
    config.dispatch = DispatchConfig {
        attempt_timeout_secs: 2,
        request_timeout_secs: 10,
        connect_timeout_secs: 1,
        backoff: BackoffConfig {
            initial_ms: 1,
            max_ms: 10,
            ..BackoffConfig::default()
        },
        ..DispatchConfig::default()
    };
    config
}

pub async fn create_test_state(backend_ports: &[u16]) -> Arc<AppState> {
    Arc::new(
        AppState::new(test_config(backend_ports))
            .await
            .expect("Failed to build test state"),
    )
}

pub fn chat_request(stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: Some(TEST_MODEL.to_string()),
        messages: vec![ChatMessage::new("user", "Hello")],
        stream: Some(stream),
        ..Default::default()
    }
}

/// How a scripted backend answers every call.
#[derive(Clone)]
pub enum Script {
    Reply(ChatCompletionResponse),
    Fail(BackendError),
    /// Never answers.
    Hang,
    Stream { parts: Vec<String>, end: StreamEnd },
    /// Emits chunks until the consumer goes away.
    Endless,
}

impl Script {
    pub fn reply(content: &str) -> Self {
        Script::Reply(mock_backend::completion(TEST_MODEL, content))
    }

    pub fn stream(parts: &[&str]) -> Self {
        Self::stream_ending(parts, StreamEnd::Done)
    }

    /// Emits `parts`, then fails.
    pub fn broken_stream(parts: &[&str]) -> Self {
        Self::stream_ending(parts, StreamEnd::Error)
    }

    /// Emits `parts`, then ends without completing.
    pub fn truncated_stream(parts: &[&str]) -> Self {
        Self::stream_ending(parts, StreamEnd::Eof)
    }

    fn stream_ending(parts: &[&str], end: StreamEnd) -> Self {
        Script::Stream {
            parts: parts.iter().map(|p| p.to_string()).collect(),
            end,
        }
    }

    pub fn endless_stream() -> Self {
        Script::Endless
    }
}

/// How a scripted stream finishes after its chunks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Done,
    /// A transport error after the last chunk.
    Error,
    /// The stream just stops, with no `[DONE]` and no error.
    Eof,
}

/// In-process `BackendClient` whose behaviour is scripted per backend ID.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, backend_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(backend_id.to_string(), script);
    }

    /// Backend IDs called so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn begin(&self, backend: &Backend) -> Option<Script> {
        self.calls.lock().unwrap().push(backend.id.clone());
        self.scripts.lock().unwrap().get(&backend.id).cloned()
    }
}

#[async_trait]
impl BackendClient for ScriptedClient {
    async fn chat_completion(
        &self,
        backend: &Backend,
        _request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BackendError> {
        match self.begin(backend) {
            Some(Script::Reply(response)) => Ok(response),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Hang) => std::future::pending().await,
            Some(_) => Err(BackendError::InvalidResponse("scripted as a stream".to_string())),
            None => Err(BackendError::Transport(format!("no script for {}", backend.id))),
        }
    }

    async fn chat_completion_stream(
        &self,
        backend: &Backend,
        _request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError> {
        match self.begin(backend) {
            Some(Script::Stream { parts, end }) => {
                let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
                let mut frames: Vec<Result<StreamFrame, BackendError>> = Vec::new();
                for (i, part) in parts.iter().enumerate() {
                    let last = end == StreamEnd::Done && i + 1 == parts.len();
                    let usage = last.then(|| mock_backend::stream_usage(parts.len()));
                    let chunk = mock_backend::chunk(TEST_MODEL, part, usage);
                    frames.push(Ok(StreamFrame::Chunk {
                        data: serde_json::to_string(&chunk).unwrap(),
                        usage,
                        finished: last,
                    }));
                }
                match end {
                    StreamEnd::Done => frames.push(Ok(StreamFrame::Done)),
                    StreamEnd::Error => frames.push(Err(BackendError::Interrupted(
                        "connection reset".to_string(),
                    ))),
                    StreamEnd::Eof => {}
                }
                Ok(stream::iter(frames).boxed())
            }
            Some(Script::Endless) => {
                let frames = stream::unfold(0u64, |n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let chunk = mock_backend::chunk(TEST_MODEL, &format!("tick {}", n), None);
                    let frame = StreamFrame::Chunk {
                        data: serde_json::to_string(&chunk).unwrap(),
                        usage: None,
                        finished: false,
                    };
                    Some((Ok(frame), n + 1))
                });
                Ok(frames.boxed())
            }
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Reply(_)) => {
                Err(BackendError::InvalidResponse("scripted as a reply".to_string()))
            }
            None => Err(BackendError::Transport(format!("no script for {}", backend.id))),
        }
    }
}
