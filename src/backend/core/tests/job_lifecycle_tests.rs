//! Integration tests for the job lifecycle.
//!
//! Tests cover:
//! - Retry with backoff until attempts are exhausted
//! - Fatal errors
//! - Delayed eligibility
//! - Stall recovery and the stall limit
//! - Lease loss of a slow worker
//! - Bulk enqueue under concurrent producers
//! - Transient store failures during claim and finalize
//! - Retry delays far in the future

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tollgate_core::clock::{Clock, MockClock};
use tollgate_core::error::{ErrorCode, Result, TollgateError};
use tollgate_core::jobs::{
    handler_fn, BackoffPolicy, HandlerOptions, InMemoryJobStore, Job, JobCounts, JobError,
    JobEvent, JobId, JobOptions, JobQueue, JobState, JobStore, NewJob, ProcessOutcome,
    WorkerConfig, WorkerPool, MAX_DELAY_MS, STALLED_ERROR,
};

const LEASE: Duration = Duration::from_secs(30);

struct Harness {
    clock: MockClock,
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    pool: WorkerPool,
}

fn harness() -> Harness {
    let clock = MockClock::new();
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let config = WorkerConfig {
        lease_duration: LEASE,
        poll_interval: Duration::from_millis(10),
        max_stalled_count: 1,
        ..WorkerConfig::default()
    };

    Harness {
        queue: JobQueue::new(store.clone(), shared_clock.clone()),
        pool: WorkerPool::new(store.clone(), config, shared_clock),
        store,
        clock,
    }
}

fn drain(events: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_always_failing_job_exhausts_attempts() {
    let h = harness();
    h.pool
        .register_handler(
            "email",
            handler_fn(|_ctx| async { Err(JobError::retryable("smtp unavailable")) }),
            HandlerOptions::default(),
        )
        .unwrap();
    let mut events = h.pool.subscribe();

    let options = JobOptions::new()
        .attempts(3)
        .backoff(BackoffPolicy::exponential(2000));
    let id = h.queue.enqueue("email", json!({"to": "a@b.c"}), options).await.unwrap();
    assert_eq!(h.queue.require(id).await.unwrap().state, JobState::Waiting);

    let mut states = vec![JobState::Waiting];
    for backoff in [2, 4] {
        let outcome = h.pool.process_next("email", "w1").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { .. }));
        states.push(JobState::Active);
        states.push(h.queue.require(id).await.unwrap().state);

        // Not eligible until the backoff has elapsed.
        h.clock.advance(chrono::Duration::seconds(backoff - 1));
        assert_eq!(h.pool.process_next("email", "w1").await.unwrap(), None);
        h.clock.advance(chrono::Duration::seconds(1));
    }

    let outcome = h.pool.process_next("email", "w1").await.unwrap().unwrap();
    assert_eq!(outcome, ProcessOutcome::Failed);
    states.push(JobState::Active);

    let job = h.queue.require(id).await.unwrap();
    states.push(job.state);
    assert_eq!(
        states,
        vec![
            JobState::Waiting,
            JobState::Active,
            JobState::Delayed,
            JobState::Active,
            JobState::Delayed,
            JobState::Active,
            JobState::Failed,
        ]
    );
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.last_error.as_deref(), Some("smtp unavailable"));

    let retries: Vec<bool> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            JobEvent::Failed { will_retry, .. } => Some(will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![true, true, false]);
}

#[tokio::test]
async fn test_fatal_error_fails_immediately() {
    let h = harness();
    h.pool
        .register_handler(
            "email",
            handler_fn(|_ctx| async { Err(JobError::fatal("invalid recipient")) }),
            HandlerOptions::default(),
        )
        .unwrap();

    let id = h
        .queue
        .enqueue("email", json!({}), JobOptions::new().attempts(5))
        .await
        .unwrap();

    assert_eq!(
        h.pool.process_next("email", "w1").await.unwrap(),
        Some(ProcessOutcome::Failed)
    );
    let job = h.queue.require(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 1);
}

#[tokio::test]
async fn test_retry_succeeds_on_second_attempt() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    h.pool
        .register_handler(
            "email",
            handler_fn(move |ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt() == 1 {
                        Err(JobError::retryable("transient"))
                    } else {
                        Ok(json!({"attempt": ctx.attempt()}))
                    }
                }
            }),
            HandlerOptions::default(),
        )
        .unwrap();

    let id = h
        .queue
        .enqueue("email", json!({}), JobOptions::new().attempts(3))
        .await
        .unwrap();

    h.pool.process_next("email", "w1").await.unwrap();
    h.pool.process_next("email", "w1").await.unwrap();

    let job = h.queue.require(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({"attempt": 2})));
    assert_eq!(job.attempts_made, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_delayed_job_runs_after_delay() {
    let h = harness();
    h.pool
        .register_handler("email", handler_fn(|_ctx| async { Ok(json!(null)) }), HandlerOptions::default())
        .unwrap();

    let id = h
        .queue
        .enqueue("email", json!({}), JobOptions::new().delay(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(h.queue.counts("email").await.unwrap().delayed, 1);

    h.clock.advance(chrono::Duration::milliseconds(4999));
    assert_eq!(h.pool.process_next("email", "w1").await.unwrap(), None);

    h.clock.advance(chrono::Duration::milliseconds(1));
    assert_eq!(
        h.pool.process_next("email", "w1").await.unwrap(),
        Some(ProcessOutcome::Completed)
    );
    assert_eq!(h.queue.require(id).await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let h = harness();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = order.clone();
    h.pool
        .register_handler(
            "email",
            handler_fn(move |ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(ctx.payload()["n"].as_i64().unwrap_or_default());
                    Ok(json!(null))
                }
            }),
            HandlerOptions::default(),
        )
        .unwrap();

    h.queue.enqueue("email", json!({"n": 1}), JobOptions::new().priority(1)).await.unwrap();
    h.queue.enqueue("email", json!({"n": 2}), JobOptions::new().priority(10)).await.unwrap();
    h.queue.enqueue("email", json!({"n": 3}), JobOptions::new().priority(10)).await.unwrap();

    while h.pool.process_next("email", "w1").await.unwrap().is_some() {}
    assert_eq!(*order.lock(), vec![2, 3, 1]);
}

// ============================================================================
// Stalls and Leases
// ============================================================================

#[tokio::test]
async fn test_stalled_job_is_reclaimed_and_completed() {
    let h = harness();
    h.pool
        .register_handler("email", handler_fn(|_ctx| async { Ok(json!("done")) }), HandlerOptions::default())
        .unwrap();
    let mut events = h.pool.subscribe();

    let id = h.queue.enqueue("email", json!({}), JobOptions::default()).await.unwrap();

    // A worker claims the job and dies without finishing.
    h.store
        .claim_next("email", "crashed", LEASE, h.clock.now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.pool.recover_stalled().await.unwrap(), 0);

    h.clock.advance_std(LEASE + Duration::from_secs(1));
    assert_eq!(h.pool.recover_stalled().await.unwrap(), 1);

    let job = h.queue.require(id).await.unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.stalled_count, 1);
    assert!(job.locked_by.is_none());

    assert_eq!(
        h.pool.process_next("email", "w2").await.unwrap(),
        Some(ProcessOutcome::Completed)
    );
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, JobEvent::Stalled { failed: false, .. })));
}

#[tokio::test]
async fn test_job_stalling_too_often_fails() {
    let h = harness();
    h.pool
        .register_handler("email", handler_fn(|_ctx| async { Ok(json!(null)) }), HandlerOptions::default())
        .unwrap();

    let id = h.queue.enqueue("email", json!({}), JobOptions::default()).await.unwrap();

    for _ in 0..2 {
        h.store
            .claim_next("email", "crashed", LEASE, h.clock.now())
            .await
            .unwrap()
            .unwrap();
        h.clock.advance_std(LEASE + Duration::from_secs(1));
        assert_eq!(h.pool.recover_stalled().await.unwrap(), 1);
    }

    let job = h.queue.require(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.stalled_count, 2);
    assert_eq!(job.last_error.as_deref(), Some(STALLED_ERROR));
}

#[tokio::test]
async fn test_slow_worker_loses_lease() {
    let h = harness();
    let release = Arc::new(Notify::new());
    let first = Arc::new(AtomicBool::new(true));
    let gate = release.clone();
    h.pool
        .register_handler(
            "email",
            handler_fn(move |ctx| {
                let gate = gate.clone();
                let slow = first.swap(false, Ordering::SeqCst);
                async move {
                    if slow {
                        gate.notified().await;
                    }
                    Ok(json!({"worker": ctx.worker_id()}))
                }
            }),
            HandlerOptions::default(),
        )
        .unwrap();
    let mut events = h.pool.subscribe();

    let id = h.queue.enqueue("email", json!({}), JobOptions::default()).await.unwrap();

    let pool = h.pool.clone();
    let slow = tokio::spawn(async move { pool.process_next("email", "slow").await });
    loop {
        if let JobEvent::Active { .. } = events.recv().await.unwrap() {
            break;
        }
    }

    h.clock.advance_std(LEASE + Duration::from_secs(1));
    assert_eq!(h.pool.recover_stalled().await.unwrap(), 1);
    assert_eq!(
        h.pool.process_next("email", "fast").await.unwrap(),
        Some(ProcessOutcome::Completed)
    );

    release.notify_one();
    assert_eq!(slow.await.unwrap().unwrap(), Some(ProcessOutcome::LeaseLost));

    let job = h.queue.require(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!({"worker": "fast"})));
    assert_eq!(h.pool.stats().lease_lost(), 1);
}

// ============================================================================
// Producers
// ============================================================================

#[tokio::test]
async fn test_concurrent_bulk_enqueue_distinct_ids() {
    let h = harness();

    let handles: Vec<_> = (0..3)
        .map(|caller| {
            let queue = h.queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue_bulk(
                        (0..3)
                            .map(|n| NewJob::new("email", json!({"caller": caller, "n": n})))
                            .collect(),
                    )
                    .await
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for result in handle.await.unwrap() {
            ids.insert(result.unwrap());
        }
    }

    assert_eq!(ids.len(), 9);
    assert_eq!(h.queue.counts("email").await.unwrap().waiting, 9);
}

#[tokio::test]
async fn test_remove_refuses_active_job() {
    let h = harness();
    let id = h.queue.enqueue("email", json!({}), JobOptions::default()).await.unwrap();
    h.store
        .claim_next("email", "w1", LEASE, h.clock.now())
        .await
        .unwrap();

    let err = h.queue.remove(id).await.unwrap_err();
    assert_eq!(err.code(), tollgate_core::ErrorCode::JobActive);
    assert_eq!(err.http_status().as_u16(), 409);
}

// ============================================================================
// Transient Store Failures
// ============================================================================

/// In-memory store whose first `claim_next` and `finalize` calls time out.
struct FlakyStore {
    inner: InMemoryJobStore,
    claim_failures: AtomicU32,
    finalize_failures: AtomicU32,
}

impl FlakyStore {
    fn new(claim_failures: u32, finalize_failures: u32) -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            claim_failures: AtomicU32::new(claim_failures),
            finalize_failures: AtomicU32::new(finalize_failures),
        }
    }

    fn trip(counter: &AtomicU32, operation: &str) -> Result<()> {
        let left = counter.load(Ordering::SeqCst);
        if left > 0 {
            counter.store(left - 1, Ordering::SeqCst);
            return Err(TollgateError::store_timeout(operation));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn next_sequence(&self) -> Result<u64> {
        self.inner.next_sequence().await
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.inner.get(id).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        Self::trip(&self.claim_failures, "claim_next")?;
        self.inner.claim_next(queue, worker_id, lease, now).await
    }

    async fn finalize(&self, job: &Job, expected_token: &str) -> Result<()> {
        Self::trip(&self.finalize_failures, "finalize")?;
        self.inner.finalize(job, expected_token).await
    }

    async fn extend_lease(&self, id: JobId, token: &str, until: DateTime<Utc>) -> Result<bool> {
        self.inner.extend_lease(id, token, until).await
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>> {
        self.inner.expired_leases(queue, now).await
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        self.inner.remove(id).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.inner.counts(queue).await
    }

    async fn queues(&self) -> Result<Vec<String>> {
        self.inner.queues().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

fn flaky_pool(store: Arc<FlakyStore>, runs: Arc<AtomicU32>) -> (JobQueue, WorkerPool) {
    let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
    let store: Arc<dyn JobStore> = store;
    let queue = JobQueue::new(store.clone(), clock.clone());
    let pool = WorkerPool::new(store, WorkerConfig::default(), clock);
    pool.register_handler(
        "email",
        handler_fn(move |_ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!("sent"))
            }
        }),
        HandlerOptions::default(),
    )
    .unwrap();
    (queue, pool)
}

#[tokio::test(start_paused = true)]
async fn test_transient_finalize_failure_keeps_result() {
    let runs = Arc::new(AtomicU32::new(0));
    let (queue, pool) = flaky_pool(Arc::new(FlakyStore::new(1, 2)), runs.clone());
    let id = queue.enqueue("email", json!({}), JobOptions::default()).await.unwrap();

    let outcome = pool.process_next("email", "w1").await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::Completed));

    let job = queue.require(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!("sent")));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().lease_lost(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_store_failure_is_bounded() {
    let runs = Arc::new(AtomicU32::new(0));
    let (queue, pool) = flaky_pool(Arc::new(FlakyStore::new(0, 100)), runs.clone());
    let id = queue.enqueue("email", json!({}), JobOptions::default()).await.unwrap();

    let err = pool.process_next("email", "w1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StoreTimeout);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Still leased: the stall sweep recovers it once the lease lapses.
    assert_eq!(queue.require(id).await.unwrap().state, JobState::Active);
}

// ============================================================================
// Far-future Retries
// ============================================================================

#[tokio::test]
async fn test_retry_delay_past_many_attempts_is_capped() {
    let h = harness();
    h.pool
        .register_handler(
            "email",
            handler_fn(|_ctx| async { Err(JobError::retryable("smtp unavailable")) }),
            HandlerOptions::default(),
        )
        .unwrap();

    let options = JobOptions::new()
        .attempts(100)
        .backoff(BackoffPolicy::exponential(2000));
    let now = h.clock.now();
    let mut job = Job::new("email", json!({}), options, 1, now);
    job.attempts_made = 59;
    h.store.insert(&job).await.unwrap();

    let outcome = h.pool.process_next("email", "w1").await.unwrap().unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Retrying {
            at: now + chrono::Duration::milliseconds(MAX_DELAY_MS)
        }
    );
    let stored = h.queue.require(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert_eq!(stored.attempts_made, 60);
}

#[tokio::test]
async fn test_unbounded_delay_rejected_at_enqueue() {
    let h = harness();
    let options = JobOptions {
        delay_ms: i64::MAX,
        ..JobOptions::default()
    };

    let err = h.queue.enqueue("email", json!({}), options).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert_eq!(err.field(), Some("delay"));
    assert_eq!(h.queue.counts("email").await.unwrap().total(), 0);
}
