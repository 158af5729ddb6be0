pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod routes;
pub mod test_util;

pub use auth::{Gate, Principal};
pub use config::Config;
pub use error::GatewayError;
pub use gateway::{
    BackendClient, BackendRegistry, Dispatcher, HealthTracker, HttpBackendClient, LeastBusyRouter,
};

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Known inference backends.
    pub registry: Arc<BackendRegistry>,
    /// Health and in-flight load per backend.
    pub tracker: Arc<HealthTracker>,
    pub router: LeastBusyRouter,
    pub dispatcher: Dispatcher,
    /// API keys and quotas.
    pub gate: Gate,
}

impl AppState {
    /// Build state that talks to backends over HTTP.
    pub async fn new(config: Config) -> Result<Self, reqwest::Error> {
        let client = HttpBackendClient::new(config.dispatch.connect_timeout())?;
        Ok(Self::with_client(config, Arc::new(client)).await)
    }

    /// Build state around any backend client.
    pub async fn with_client(config: Config, client: Arc<dyn BackendClient>) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        for backend in &config.backends {
            registry
                .register(backend.id(), backend.base_url(), backend.models.clone())
                .await;
        }
        if registry.is_empty().await {
            tracing::warn!("No backends configured; every chat request will fail");
        }

        let tracker = Arc::new(HealthTracker::new(registry.clone(), config.health.clone()));
        let router = LeastBusyRouter::new(registry.clone(), tracker.clone());
        let dispatcher = Dispatcher::new(
            router.clone(),
            tracker.clone(),
            client,
            config.dispatch.clone(),
        );
        let gate = Gate::new(&config.auth);

        Self {
            config,
            registry,
            tracker,
            router,
            dispatcher,
            gate,
        }
    }
}

/// The full HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .nest(
            "/v1",
            routes::chat::router(state.clone()).merge(routes::models::router(state)),
        )
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
