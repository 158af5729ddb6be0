//! Core request path: registry, health tracking, routing and dispatch.
//!
//! This module provides:
//! - Backend registry for the configured inference servers
//! - Passive health and in-flight load tracking
//! - Least-busy routing with deterministic tie-breaks
//! - Dispatch with bounded failover and streaming relay

mod client;
mod context;
mod dispatcher;
mod health;
mod registry;
mod router;
mod sse;

pub use client::{BackendClient, BackendError, ChunkStream, HttpBackendClient, StreamFrame};
pub use context::{RequestContext, RequestPhase};
pub use dispatcher::{Dispatched, Dispatcher, RelayEvent, RelayStream};
pub use health::{
    BackendSnapshot, BackendStats, Eligibility, HealthSample, HealthState, HealthTracker,
    LoadGuard, Outcome,
};
pub use registry::{Backend, BackendRegistry, RegistryError};
pub use router::{LeastBusyRouter, RouteError};
pub use sse::{SseDecoder, SseFrame};
