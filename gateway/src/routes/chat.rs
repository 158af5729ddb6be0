//! OpenAI-compatible chat completions endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use llm_gateway_common::{ChatCompletionRequest, STREAM_DONE};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::gateway::{Dispatched, RelayEvent, RequestContext};
use crate::logging::{request_id, BACKEND_HEADER};
use crate::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let mut ctx = RequestContext::new(request_id(&headers), String::new(), false);

    // Authentication comes before looking at the body at all.
    let principal = state
        .gate
        .authorize(&headers)
        .map_err(|e| ctx.fail(e.into()))?;
    ctx.authenticate(principal.clone());

    let Json(request) = body.map_err(|e| ctx.fail(GatewayError::InvalidRequest(e.body_text())))?;
    ctx.model = validate(&request).map_err(|e| ctx.fail(e))?;
    ctx.stream = request.is_stream();

    state
        .gate
        .check_quota(&principal)
        .map_err(|e| ctx.fail(e.into()))?;

    tracing::debug!(
        request_id = %ctx.id,
        key = %principal.name,
        model = %ctx.model,
        stream = ctx.stream,
        "Dispatching chat completion"
    );

    let dispatched = state.dispatcher.dispatch(ctx, &request).await?;
    match dispatched {
        Dispatched::Complete {
            response,
            backend_id,
        } => {
            if let Some(usage) = response.usage {
                state.gate.record_usage(&principal, usage.total_tokens as u64);
            }
            let mut response = Json(response).into_response();
            tag_backend(&mut response, &backend_id);
            Ok(response)
        }
        Dispatched::Stream(relay) => {
            let backend_id = relay.backend_id;
            let events = ReceiverStream::new(relay.events).map(move |event| {
                let event = match event {
                    RelayEvent::Chunk(data) => Event::default().data(data),
                    RelayEvent::Done { usage } => {
                        if let Some(usage) = usage {
                            state.gate.record_usage(&principal, usage.total_tokens as u64);
                        }
                        Event::default().data(STREAM_DONE)
                    }
                    RelayEvent::Interrupted(err) => {
                        let body = serde_json::to_string(&err.to_body()).unwrap_or_default();
                        Event::default().data(body)
                    }
                };
                Ok::<_, Infallible>(event)
            });

            let mut response = Sse::new(events)
                .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
                .into_response();
            tag_backend(&mut response, &backend_id);
            Ok(response)
        }
    }
}

/// Check the fields the gateway itself depends on; everything else is the backend's call.
fn validate(request: &ChatCompletionRequest) -> Result<String, GatewayError> {
    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("'model' is required".to_string()))?;

    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "'messages' must not be empty".to_string(),
        ));
    }

    Ok(model.to_string())
}

fn tag_backend(response: &mut Response, backend_id: &str) {
    if let Ok(value) = HeaderValue::from_str(backend_id) {
        response.headers_mut().insert(BACKEND_HEADER, value);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .with_state(state)
}
