//! Least-busy selection of a backend for a model.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use super::health::{HealthState, HealthTracker};
use super::registry::{Backend, BackendRegistry, RegistryError};

/// Errors from backend selection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("No backend serves model '{0}'")]
    UnknownModel(String),
    #[error("No healthy backend available for model '{0}'")]
    NoHealthyBackend(String),
}

impl From<RegistryError> for RouteError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownModel(model) => RouteError::UnknownModel(model),
        }
    }
}

/// Picks the eligible backend with the fewest in-flight requests.
///
/// Ties go to the healthier backend, then to the one registered first.
#[derive(Clone)]
pub struct LeastBusyRouter {
    registry: Arc<BackendRegistry>,
    tracker: Arc<HealthTracker>,
}

impl LeastBusyRouter {
    pub fn new(registry: Arc<BackendRegistry>, tracker: Arc<HealthTracker>) -> Self {
        Self { registry, tracker }
    }

    /// Select a backend for `model`.
    pub async fn select(&self, model: &str) -> Result<Arc<Backend>, RouteError> {
        self.select_excluding(model, &[]).await
    }

    /// Select a backend for `model`, skipping backends already tried by this request.
    pub async fn select_excluding(
        &self,
        model: &str,
        exclude: &[String],
    ) -> Result<Arc<Backend>, RouteError> {
        let bound = self.registry.backends_for(model).await?;
        let now = Instant::now();

        let selected = bound
            .into_iter()
            .filter(|b| !exclude.contains(&b.id))
            .filter_map(|b| {
                let view = self.tracker.eligibility(&b, now);
                view.eligible.then_some((view.load, rank(view.state), b.seq, b))
            })
            .min_by_key(|(load, rank, seq, _)| (*load, *rank, *seq))
            .map(|(load, _, _, backend)| {
                tracing::debug!("Selected backend {} for {} (load {})", backend.id, model, load);
                backend
            });

        selected.ok_or_else(|| RouteError::NoHealthyBackend(model.to_string()))
    }

    /// Models served by at least one eligible backend, sorted.
    pub async fn routable_models(&self) -> Vec<String> {
        let now = Instant::now();
        let models: BTreeSet<String> = self
            .registry
            .all()
            .await
            .iter()
            .filter(|b| self.tracker.eligibility(b, now).eligible)
            .flat_map(|b| b.models.iter().cloned())
            .collect();
        models.into_iter().collect()
    }
}

fn rank(state: HealthState) -> u8 {
    match state {
        HealthState::Healthy => 0,
        HealthState::Degraded => 1,
        HealthState::Unreachable => 2,
    }
}
