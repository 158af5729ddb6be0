use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::gateway::HealthState;
use crate::AppState;

#[derive(Debug, Default, Serialize)]
struct BackendCounts {
    total: usize,
    healthy: usize,
    degraded: usize,
    unreachable: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    /// "ok" while at least one backend can take traffic, otherwise "unavailable".
    status: &'static str,
    version: &'static str,
    backends: BackendCounts,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshots = state.tracker.snapshot_all().await;

    let mut counts = BackendCounts {
        total: snapshots.len(),
        ..Default::default()
    };
    for snapshot in &snapshots {
        match snapshot.health {
            HealthState::Healthy => counts.healthy += 1,
            HealthState::Degraded => counts.degraded += 1,
            HealthState::Unreachable => counts.unreachable += 1,
        }
    }

    let status = if snapshots.iter().any(|s| s.eligible) {
        "ok"
    } else {
        "unavailable"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        backends: counts,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
