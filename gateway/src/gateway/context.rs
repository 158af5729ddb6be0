//! Per-request lifecycle tracking.

use std::time::{Duration, Instant};

use crate::auth::Principal;
use crate::error::GatewayError;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Authenticated,
    Routed,
    Dispatching,
    Streaming,
    Completed,
    Closed,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Closed | RequestPhase::Failed)
    }

    fn can_advance_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Closed => true,
            Authenticated => self == Received,
            // Failover re-routes a request that was already dispatching.
            Routed => matches!(self, Authenticated | Dispatching),
            Dispatching => self == Routed,
            Streaming => self == Dispatching,
            Completed => matches!(self, Dispatching | Streaming),
            Received => false,
        }
    }
}

/// Everything the gateway knows about one in-flight client request.
///
/// Owned by whichever task is currently serving the request; dropping it
/// closes the request.
#[derive(Debug)]
pub struct RequestContext {
    pub id: String,
    pub model: String,
    pub stream: bool,
    pub principal: Option<Principal>,
    /// Dispatch attempts made so far.
    pub attempts: u32,
    /// Backend of the current or last attempt.
    pub backend: Option<String>,
    /// Backends already attempted, excluded from failover.
    pub tried: Vec<String>,
    started: Instant,
    phase: RequestPhase,
}

impl RequestContext {
    pub fn new(id: impl Into<String>, model: impl Into<String>, stream: bool) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            stream,
            principal: None,
            attempts: 0,
            backend: None,
            tried: Vec::new(),
            started: Instant::now(),
            phase: RequestPhase::Received,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn authenticate(&mut self, principal: Principal) {
        self.principal = Some(principal);
        self.advance(RequestPhase::Authenticated);
    }

    /// Bind the request to the backend chosen for the next attempt.
    pub fn route_to(&mut self, backend_id: &str) {
        self.backend = Some(backend_id.to_string());
        self.tried.push(backend_id.to_string());
        self.advance(RequestPhase::Routed);
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.advance(RequestPhase::Dispatching);
    }

    pub fn start_streaming(&mut self) {
        self.advance(RequestPhase::Streaming);
    }

    pub fn complete(&mut self) {
        self.advance(RequestPhase::Completed);
    }

    pub fn close(&mut self) {
        self.advance(RequestPhase::Closed);
    }

    /// Mark the request failed, handing the error back for the caller to surface.
    pub fn fail(&mut self, err: GatewayError) -> GatewayError {
        tracing::warn!(
            request_id = %self.id,
            model = %self.model,
            attempts = self.attempts,
            "Request failed: {}",
            err
        );
        self.advance(RequestPhase::Failed);
        err
    }

    fn advance(&mut self, next: RequestPhase) {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(
                request_id = %self.id,
                "Ignoring invalid request transition {:?} -> {:?}",
                self.phase,
                next
            );
            return;
        }
        tracing::trace!(request_id = %self.id, "{:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        if !matches!(self.phase, RequestPhase::Completed | RequestPhase::Streaming) {
            tracing::debug!(
                request_id = %self.id,
                "Request abandoned in phase {:?}",
                self.phase
            );
        }
        self.close();
        tracing::debug!(
            request_id = %self.id,
            backend = self.backend.as_deref().unwrap_or("-"),
            attempts = self.attempts,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Request closed"
        );
    }
}
