//! Backend registry: which inference servers exist and which models they serve.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use super::health::BackendStats;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No backend serves model '{0}'")]
    UnknownModel(String),
}

/// An inference server reachable over HTTP.
///
/// The model list is fixed for the lifetime of this value; re-registering the
/// same identity swaps in a new `Backend` that shares the old `stats`.
#[derive(Debug)]
pub struct Backend {
    /// Identity, `host:port`.
    pub id: String,
    /// Base URL requests are sent to (e.g. "http://hx-llm01-server:11434").
    pub base_url: String,
    /// Models served, in advertised order.
    pub models: Vec<String>,
    /// When the backend was first registered.
    pub registered_at: DateTime<Utc>,
    /// Registration order, used to break routing ties.
    pub(crate) seq: u64,
    pub(crate) stats: Arc<BackendStats>,
}

impl Backend {
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Requests currently dispatched to this backend.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight()
    }
}

/// Registry of known backends.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<Backend>>>,
    next_seq: AtomicU64,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, or replace the model list of an existing one.
    ///
    /// Identity, registration order, load and health survive re-registration.
    pub async fn register(
        &self,
        id: String,
        base_url: String,
        models: Vec<String>,
    ) -> Arc<Backend> {
        let mut backends = self.backends.write().await;

        let backend = match backends.get(&id) {
            Some(existing) => Arc::new(Backend {
                id: id.clone(),
                base_url,
                models,
                registered_at: existing.registered_at,
                seq: existing.seq,
                stats: existing.stats.clone(),
            }),
            None => {
                tracing::info!("Registered backend {} serving {:?}", id, models);
                Arc::new(Backend {
                    id: id.clone(),
                    base_url,
                    models,
                    registered_at: Utc::now(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    stats: Arc::new(BackendStats::default()),
                })
            }
        };

        backends.insert(id, backend.clone());
        backend
    }

    /// Remove a backend. In-flight requests keep their handle until they finish.
    pub async fn deregister(&self, id: &str) -> Option<Arc<Backend>> {
        let removed = self.backends.write().await.remove(id);
        if removed.is_some() {
            tracing::info!("Deregistered backend {}", id);
        }
        removed
    }

    /// Get a backend by ID.
    pub async fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.read().await.get(id).cloned()
    }

    /// All backends in registration order.
    pub async fn all(&self) -> Vec<Arc<Backend>> {
        let mut all: Vec<_> = self.backends.read().await.values().cloned().collect();
        all.sort_by_key(|b| b.seq);
        all
    }

    /// Backends advertising `model`, in registration order, regardless of health.
    pub async fn backends_for(&self, model: &str) -> Result<Vec<Arc<Backend>>, RegistryError> {
        let mut bound: Vec<_> = self
            .backends
            .read()
            .await
            .values()
            .filter(|b| b.serves(model))
            .cloned()
            .collect();

        if bound.is_empty() {
            return Err(RegistryError::UnknownModel(model.to_string()));
        }
        bound.sort_by_key(|b| b.seq);
        Ok(bound)
    }

    /// Count registered backends.
    pub async fn len(&self) -> usize {
        self.backends.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.backends.read().await.is_empty()
    }
}
