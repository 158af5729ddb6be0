//! Passive health tracking and in-flight load accounting per backend.
//!
//! Health is inferred from the outcome of live requests; there is no prober.
//! Each backend owns its counters, so concurrent requests to different
//! backends never contend on a shared lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::registry::{Backend, BackendRegistry};
use crate::config::HealthConfig;

/// Health state of a backend, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub outcome: Outcome,
    pub latency: Duration,
}

impl HealthSample {
    pub fn success(latency: Duration) -> Self {
        Self { outcome: Outcome::Success, latency }
    }

    pub fn failure(latency: Duration) -> Self {
        Self { outcome: Outcome::Failure, latency }
    }

    pub fn timeout(latency: Duration) -> Self {
        Self { outcome: Outcome::Timeout, latency }
    }
}

#[derive(Debug)]
struct HealthRecord {
    state: HealthState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_latency: Option<Duration>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            last_latency: None,
        }
    }
}

/// Mutable per-backend counters shared by every handle to the same backend.
#[derive(Debug, Default)]
pub struct BackendStats {
    in_flight: AtomicUsize,
    health: Mutex<HealthRecord>,
}

impl BackendStats {
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn health(&self) -> MutexGuard<'_, HealthRecord> {
        // A panic while holding this lock cannot leave the record half-written.
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds one unit of in-flight load on a backend; releases it when dropped.
#[derive(Debug)]
pub struct LoadGuard {
    stats: Arc<BackendStats>,
}

impl LoadGuard {
    fn acquire(stats: Arc<BackendStats>) -> Self {
        stats.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { stats }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What the router needs to know about a backend at selection time.
#[derive(Debug, Clone, Copy)]
pub struct Eligibility {
    pub eligible: bool,
    pub state: HealthState,
    pub load: usize,
}

/// Point-in-time view of a backend for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub base_url: String,
    pub models: Vec<String>,
    pub health: HealthState,
    pub eligible: bool,
    pub in_flight: usize,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
}

/// Applies the health policy to outcomes and answers load/eligibility queries.
pub struct HealthTracker {
    registry: Arc<BackendRegistry>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(registry: Arc<BackendRegistry>, config: HealthConfig) -> Self {
        Self { registry, config }
    }

    /// Record an outcome for a backend by ID. Unknown IDs are ignored.
    pub async fn record_outcome(&self, backend_id: &str, sample: HealthSample) {
        match self.registry.get(backend_id).await {
            Some(backend) => self.record(&backend, sample),
            None => tracing::debug!("Dropping health sample for unknown backend {}", backend_id),
        }
    }

    /// In-flight requests on a backend, 0 if unknown.
    pub async fn current_load(&self, backend_id: &str) -> usize {
        self.registry
            .get(backend_id)
            .await
            .map(|b| b.in_flight())
            .unwrap_or(0)
    }

    /// Whether the backend may receive traffic now.
    pub async fn is_eligible(&self, backend_id: &str) -> bool {
        match self.registry.get(backend_id).await {
            Some(backend) => self.eligibility(&backend, Instant::now()).eligible,
            None => false,
        }
    }

    /// Apply one sample to the backend's health state.
    pub fn record(&self, backend: &Backend, sample: HealthSample) {
        let mut record = backend.stats.health();
        record.last_latency = Some(sample.latency);
        let previous = record.state;

        match sample.outcome {
            Outcome::Success => {
                record.state = HealthState::Healthy;
                record.consecutive_failures = 0;
            }
            Outcome::Failure | Outcome::Timeout => {
                let now = Instant::now();
                let stale = record
                    .last_failure
                    .map_or(true, |t| now.duration_since(t) > self.config.failure_window());
                if stale {
                    // A fresh streak starts from the threshold of the current state.
                    record.consecutive_failures = self.failure_floor(record.state);
                }
                record.consecutive_failures += 1;
                record.last_failure = Some(now);
                record.last_failure_at = Some(Utc::now());

                let failures = record.consecutive_failures;
                let target = if failures >= self.failure_floor(HealthState::Unreachable) {
                    HealthState::Unreachable
                } else if failures >= self.failure_floor(HealthState::Degraded) {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                };
                record.state = record.state.max(target);
            }
        }

        if record.state != previous {
            match record.state {
                HealthState::Healthy => {
                    tracing::info!("Backend {} recovered ({} -> healthy)", backend.id, previous)
                }
                state => tracing::warn!(
                    "Backend {} is now {} after {} consecutive failures",
                    backend.id,
                    state,
                    record.consecutive_failures
                ),
            }
        }
    }

    /// Consecutive failures at which a backend enters `state`.
    fn failure_floor(&self, state: HealthState) -> u32 {
        match state {
            HealthState::Healthy => 0,
            HealthState::Degraded => self.config.degrade_after,
            HealthState::Unreachable => self.config.degrade_after + self.config.unreachable_after,
        }
    }

    /// Eligibility, health and load read together for routing.
    pub fn eligibility(&self, backend: &Backend, now: Instant) -> Eligibility {
        let record = backend.stats.health();
        let eligible = match record.state {
            HealthState::Healthy | HealthState::Degraded => true,
            // Passive probe: let traffic through again once the backend has sat out.
            HealthState::Unreachable => record
                .last_failure
                .map_or(true, |t| now.duration_since(t) >= self.config.probe_interval()),
        };
        Eligibility {
            eligible,
            state: record.state,
            load: backend.stats.in_flight(),
        }
    }

    /// Count a dispatch against the backend until the guard is dropped.
    pub fn begin_dispatch(&self, backend: &Backend) -> LoadGuard {
        LoadGuard::acquire(backend.stats.clone())
    }

    pub fn snapshot(&self, backend: &Backend) -> BackendSnapshot {
        let eligible = self.eligibility(backend, Instant::now()).eligible;
        let record = backend.stats.health();
        BackendSnapshot {
            id: backend.id.clone(),
            base_url: backend.base_url.clone(),
            models: backend.models.clone(),
            health: record.state,
            eligible,
            in_flight: backend.stats.in_flight(),
            consecutive_failures: record.consecutive_failures,
            last_failure_at: record.last_failure_at,
            last_latency_ms: record.last_latency.map(|d| d.as_millis() as u64),
        }
    }

    /// Snapshots of every registered backend, in registration order.
    pub async fn snapshot_all(&self) -> Vec<BackendSnapshot> {
        self.registry
            .all()
            .await
            .iter()
            .map(|b| self.snapshot(b))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Setup = (Arc<BackendRegistry>, HealthTracker, Arc<Backend>);

    fn config(probe_interval_secs: u64) -> HealthConfig {
        HealthConfig {
            degrade_after: 3,
            unreachable_after: 2,
            failure_window_secs: 30,
            probe_interval_secs,
        }
    }

    async fn setup(probe_interval_secs: u64) -> Setup {
        setup_with(config(probe_interval_secs)).await
    }

    async fn setup_with(config: HealthConfig) -> Setup {
        let registry = Arc::new(BackendRegistry::new());
        let backend = registry
            .register("a:1".to_string(), "http://a:1".to_string(), vec!["m".to_string()])
            .await;
        let tracker = HealthTracker::new(registry.clone(), config);
        (registry, tracker, backend)
    }

    fn fail(tracker: &HealthTracker, backend: &Backend, times: usize) {
        for _ in 0..times {
            tracker.record(backend, HealthSample::failure(Duration::from_millis(5)));
        }
    }

    #[tokio::test]
    async fn test_degrades_after_consecutive_failures() {
        let (_registry, tracker, backend) = setup(15).await;

        fail(&tracker, &backend, 2);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Healthy);

        tracker.record(&backend, HealthSample::timeout(Duration::from_secs(60)));
        let snapshot = tracker.snapshot(&backend);
        assert_eq!(snapshot.health, HealthState::Degraded);
        assert!(snapshot.eligible);
        assert!(snapshot.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_after_further_failures() {
        let (_registry, tracker, backend) = setup(15).await;

        fail(&tracker, &backend, 4);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Degraded);

        fail(&tracker, &backend, 1);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Unreachable);
        assert!(!tracker.is_eligible("a:1").await);
    }

    #[tokio::test]
    async fn test_degraded_backend_needs_only_further_failures_after_quiet_spell() {
        let (_registry, tracker, backend) = setup_with(HealthConfig {
            failure_window_secs: 1,
            ..config(15)
        })
        .await;

        fail(&tracker, &backend, 3);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Degraded);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        fail(&tracker, &backend, 1);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Degraded);
        fail(&tracker, &backend, 1);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Unreachable);
    }

    #[tokio::test]
    async fn test_stale_streak_resets_healthy_backend() {
        let (_registry, tracker, backend) = setup_with(HealthConfig {
            failure_window_secs: 1,
            ..config(15)
        })
        .await;

        fail(&tracker, &backend, 2);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        fail(&tracker, &backend, 2);
        let snapshot = tracker.snapshot(&backend);
        assert_eq!(snapshot.health, HealthState::Healthy);
        assert_eq!(snapshot.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_success_recovers_to_healthy() {
        let (_registry, tracker, backend) = setup(15).await;

        fail(&tracker, &backend, 5);
        tracker
            .record_outcome("a:1", HealthSample::success(Duration::from_millis(20)))
            .await;

        let snapshot = tracker.snapshot(&backend);
        assert_eq!(snapshot.health, HealthState::Healthy);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.last_latency_ms, Some(20));
    }

    #[tokio::test]
    async fn test_success_breaks_failure_streak() {
        let (_registry, tracker, backend) = setup(15).await;

        fail(&tracker, &backend, 2);
        tracker.record(&backend, HealthSample::success(Duration::ZERO));
        fail(&tracker, &backend, 2);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_unreachable_is_probed_after_interval() {
        let (_registry, tracker, backend) = setup(0).await;

        fail(&tracker, &backend, 5);
        assert_eq!(tracker.snapshot(&backend).health, HealthState::Unreachable);
        // Zero probe interval: immediately eligible for a passive probe.
        assert!(tracker.is_eligible("a:1").await);
    }

    #[tokio::test]
    async fn test_load_guard_accounting() {
        let (_registry, tracker, backend) = setup(15).await;

        let first = tracker.begin_dispatch(&backend);
        let second = tracker.begin_dispatch(&backend);
        assert_eq!(tracker.current_load("a:1").await, 2);

        drop(first);
        assert_eq!(tracker.current_load("a:1").await, 1);
        drop(second);
        assert_eq!(tracker.current_load("a:1").await, 0);
    }

    #[tokio::test]
    async fn test_load_survives_reregistration() {
        let (registry, tracker, backend) = setup(15).await;

        let _guard = tracker.begin_dispatch(&backend);
        registry
            .register("a:1".to_string(), "http://a:1".to_string(), vec!["m2".to_string()])
            .await;
        assert_eq!(tracker.current_load("a:1").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let (_registry, tracker, _backend) = setup(15).await;

        tracker
            .record_outcome("nope:0", HealthSample::failure(Duration::ZERO))
            .await;
        assert_eq!(tracker.current_load("nope:0").await, 0);
        assert!(!tracker.is_eligible("nope:0").await);
    }

    #[tokio::test]
    async fn test_concurrent_guards_never_leak() {
        let (_registry, tracker, backend) = setup(15).await;
        let tracker = Arc::new(tracker);

        let mut handles = Vec::new();
        for i in 0..64u64 {
            let tracker = tracker.clone();
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let guard = tracker.begin_dispatch(&backend);
                tokio::time::sleep(Duration::from_millis(i % 7)).await;
                drop(guard);
            }));
        }
        // Cancel a few mid-flight; their guards must still be released.
        for handle in handles.iter().step_by(5) {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        assert_eq!(backend.in_flight(), 0);
    }
}
