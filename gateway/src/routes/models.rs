//! OpenAI-compatible /v1/models endpoint and the backend status listing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use llm_gateway_common::ModelsResponse;
use serde::Serialize;

use crate::error::GatewayError;
use crate::gateway::BackendSnapshot;
use crate::AppState;

/// GET /v1/models - models served by at least one eligible backend
async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelsResponse>, GatewayError> {
    state.gate.authorize(&headers)?;
    let models = state.router.routable_models().await;
    Ok(Json(ModelsResponse::from_ids(models)))
}

#[derive(Debug, Serialize)]
pub struct BackendsResponse {
    pub object: &'static str,
    pub data: Vec<BackendSnapshot>,
}

/// GET /v1/backends - health and load of every registered backend
async fn list_backends(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BackendsResponse>, GatewayError> {
    state.gate.authorize(&headers)?;
    Ok(Json(BackendsResponse {
        object: "list",
        data: state.tracker.snapshot_all().await,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/backends", get(list_backends))
        .with_state(state)
}
