//! Durable background jobs.
//!
//! - **Job**: record, state machine, options and backoff
//! - **Store**: persistence with atomic claims and lease compare-and-set
//! - **Queue**: producer API (enqueue, bulk enqueue, inspect, remove)
//! - **Worker**: per-queue concurrent execution with retries, stall
//!   recovery and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌──────────────────────────────┐   claim    ┌──────────────┐
//! │   JobQueue   │──────────▶│           JobStore            │◀──────────│  WorkerPool  │
//! │  (producer)  │            │  waiting │ delayed │ active   │  finalize  │  (consumer)  │
//! └──────────────┘            │  completed │ failed           │───────────▶│              │
//!                             └──────────────────────────────┘            └──────┬───────┘
//!                                                                                │ JobEvent
//!                                                                                ▼
//!                                                                         broadcast subscribers
//! ```
//!
//! # State machine
//!
//! ```text
//!            ┌─────────┐  claim   ┌────────┐ success ┌───────────┐
//! enqueue ──▶│ Waiting │────────▶│ Active │───────▶│ Completed │
//!     │      └─────────┘         └────────┘        └───────────┘
//!     │  delay    ▲  ▲   due         │  │ failure, attempts left
//!     │ ┌─────────┴┐ │               │  └──────────────▶ Delayed
//!     └▶│ Delayed  │ └── stalled ────┘
//!       └──────────┘                 │ failure, exhausted or fatal
//!                                    └──────────────────▶ Failed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tollgate_core::jobs::{handler_fn, HandlerOptions, JobOptions, JobQueue, WorkerPool};
//!
//! let id = queue.enqueue("email", json!({"to": "user@example.com"}), JobOptions::default()).await?;
//!
//! pool.register_handler("email", handler_fn(|ctx| async move {
//!     ctx.log_info("sending");
//!     Ok(json!({"sent": true}))
//! }), HandlerOptions::new(4))?;
//! let handle = pool.start()?;
//! // ...
//! handle.shutdown(Duration::from_secs(30)).await;
//! ```

pub mod events;
pub mod job;
pub mod queue;
pub mod redis_store;
pub mod store;
pub mod worker;

pub use events::JobEvent;
pub use job::{
    BackoffKind, BackoffPolicy, FailureOutcome, Job, JobContext, JobError, JobId, JobOptions,
    JobResult, JobState, NewJob, MAX_DELAY_MS, MAX_PRIORITY, STALLED_ERROR,
};
pub use queue::{validate_queue_name, JobQueue, QueueHealthReport};
pub use redis_store::RedisJobStore;
pub use store::{InMemoryJobStore, JobCounts, JobStore};
pub use worker::{
    handler_fn, HandlerOptions, JobHandler, ProcessOutcome, ShutdownReport, WorkerConfig,
    WorkerPool, WorkerPoolHandle, WorkerStats,
};
