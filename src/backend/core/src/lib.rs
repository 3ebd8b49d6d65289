#![allow(clippy::result_large_err)]
//! # Tollgate Core
//!
//! Admission control and durable background jobs over a shared store.
//!
//! ## Architecture
//!
//! - **Store**: shared key-value primitives (Redis, or in-memory for tests)
//! - **Admission**: fixed-window rate limiting, throttling and credential
//!   lockout, with a Tower layer for HTTP routes
//! - **Jobs**: priority queue with delays, retries with backoff, leases,
//!   stall recovery and a worker pool with graceful shutdown
//! - **API**: thin HTTP surface for enqueueing and inspecting jobs
//! - **Telemetry**: structured logging with redaction, Prometheus metrics

pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, TollgateError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admission::{
        AdmissionConfig, AdmissionDecision, AdmissionGate, AdmissionLayer, AdmissionPolicy,
        ClientIdentity, Namespace,
    };
    pub use crate::clock::{Clock, MockClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, Result, TollgateError};
    pub use crate::jobs::{
        handler_fn, BackoffPolicy, HandlerOptions, Job, JobContext, JobError, JobEvent, JobId,
        JobOptions, JobQueue, JobState, JobStore, NewJob, WorkerConfig, WorkerPool,
        WorkerPoolHandle,
    };
    pub use crate::store::{InMemoryStore, RedisStore, SharedStore};
}
