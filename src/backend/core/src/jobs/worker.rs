//! Worker pool executing jobs with per-queue concurrency, lease renewal,
//! stall recovery and graceful shutdown.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::events::JobEvent;
use super::job::{BackoffPolicy, FailureOutcome, Job, JobContext, JobError, JobId, JobResult};
use super::queue::validate_queue_name;
use super::store::JobStore;
use crate::clock::{offset, Clock};
use crate::config::WorkerSettings;
use crate::error::{ErrorCode, Result, TollgateError};
use crate::telemetry::JobMetrics;

const EVENT_CAPACITY: usize = 1024;

/// Retries of a store call that failed transiently, with exponential backoff
/// from 50ms (at most 1.55s in total, well inside a lease).
const STORE_RETRIES: u32 = 5;
const STORE_RETRY_BACKOFF: BackoffPolicy = BackoffPolicy::exponential(50);

/// Longest pause between polls after repeated store failures.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix of the worker ids recorded on leased jobs
    pub name: String,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Visibility timeout of a claimed job; renewed at half this interval
    pub lease_duration: Duration,
    pub stall_check_interval: Duration,
    /// Reclaims tolerated before a stalled job is failed
    pub max_stalled_count: u32,
    /// Default time [`WorkerPoolHandle::shutdown`] waits for in-flight jobs
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            poll_interval: settings.poll_interval,
            lease_duration: settings.lease_duration,
            stall_check_interval: settings.stall_check_interval,
            max_stalled_count: settings.max_stalled_count,
            drain_timeout: settings.drain_timeout,
        }
    }
}

/// Per-queue handler options.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    /// Jobs of this queue processed at once
    pub concurrency: usize,
}

impl HandlerOptions {
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency }
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> JobResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn handle(&self, ctx: JobContext) -> JobResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters for one pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub stalled: AtomicU64,
    /// Finalizes rejected because the lease had been reclaimed
    pub lease_lost: AtomicU64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn stalled(&self) -> u64 {
        self.stalled.load(Ordering::Relaxed)
    }

    pub fn lease_lost(&self) -> u64 {
        self.lease_lost.load(Ordering::Relaxed)
    }
}

/// Result of one [`WorkerPool::process_next`] call that found a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Retrying { at: chrono::DateTime<chrono::Utc> },
    Failed,
    /// The lease was reclaimed before the attempt finished; nothing was written.
    LeaseLost,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    options: HandlerOptions,
}

struct PoolInner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    instance_id: String,
    handlers: RwLock<HashMap<String, Registration>>,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
    started: AtomicBool,
    stats: WorkerStats,
}

/// Executes jobs for the queues it has handlers for.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("instance_id", &self.inner.instance_id)
            .field("queues", &self.inner.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Run `op`, retrying transient store failures with backoff. Other errors,
/// including `LeaseConflict`, return at once.
async fn with_store_retry<T, F, Fut>(operation: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(e) if e.code().is_transient_store() && retries < STORE_RETRIES => {
                retries += 1;
                let delay = STORE_RETRY_BACKOFF.delay_for_attempt(retries);
                debug!(operation, retries, delay_ms = delay.as_millis() as u64, error = %e, "Transient store error, retrying");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let suffix = Uuid::new_v4().simple().to_string();
        let instance_id = format!("{}-{}", config.name, &suffix[..8]);

        Self {
            inner: Arc::new(PoolInner {
                store,
                clock,
                config,
                instance_id,
                handlers: RwLock::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                stats: WorkerStats::default(),
            }),
        }
    }

    /// Register the handler for `queue`, replacing any previous one. Takes
    /// effect for pools started afterwards.
    pub fn register_handler(
        &self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        options: HandlerOptions,
    ) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TollgateError::shutting_down());
        }
        let queue = queue.into();
        validate_queue_name(&queue)?;
        if options.concurrency == 0 {
            return Err(TollgateError::validation(
                "concurrency",
                "concurrency must be at least 1",
            ));
        }

        info!(queue = %queue, concurrency = options.concurrency, "Job handler registered");
        self.inner
            .handlers
            .write()
            .insert(queue, Registration { handler, options });
        Ok(())
    }

    /// Receive lifecycle events. Slow receivers miss events rather than
    /// blocking workers.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.inner.handlers.read().keys().cloned().collect();
        queues.sort();
        queues
    }

    fn emit(&self, event: JobEvent) {
        JobMetrics::event(event.queue(), event.name());
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Claim and run one job of `queue`. Returns `None` when nothing is
    /// eligible, and `ShuttingDown` once the pool has been stopped.
    #[instrument(skip(self), fields(worker = %worker_id))]
    pub async fn process_next(&self, queue: &str, worker_id: &str) -> Result<Option<ProcessOutcome>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TollgateError::shutting_down());
        }
        let handler = self
            .inner
            .handlers
            .read()
            .get(queue)
            .map(|r| r.handler.clone())
            .ok_or_else(|| {
                TollgateError::new(
                    ErrorCode::NoHandlerRegistered,
                    format!("No handler registered for queue '{}'", queue),
                )
            })?;

        let lease = self.inner.config.lease_duration;
        let store = &self.inner.store;
        let clock = &self.inner.clock;
        let claimed = with_store_retry("claim_next", || {
            store.claim_next(queue, worker_id, lease, clock.now())
        })
        .await?;
        let Some(mut job) = claimed else {
            return Ok(None);
        };
        let token = job
            .lock_token
            .clone()
            .ok_or_else(|| TollgateError::internal("claimed job carries no lease token"))?;

        self.inner.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.emit(JobEvent::Active {
            job_id: job.id,
            queue: job.queue.clone(),
            attempt: job.attempts_made + 1,
            at: self.inner.clock.now(),
        });
        debug!(job_id = %job.id, attempt = job.attempts_made + 1, "Job started");

        let started = Instant::now();
        let ctx = JobContext::new(job.clone(), worker_id, self.inner.shutdown.child_token());
        let result = self.run_with_lease(handler, ctx, job.id, &token).await;
        JobMetrics::duration(queue, started.elapsed().as_secs_f64());

        let now = self.inner.clock.now();
        let (outcome, failure) = match result {
            Ok(value) => {
                job.complete(value, now);
                (ProcessOutcome::Completed, None)
            }
            Err(err) => match job.fail(&err, now) {
                FailureOutcome::Retry { at } => (ProcessOutcome::Retrying { at }, Some(err)),
                FailureOutcome::Exhausted => (ProcessOutcome::Failed, Some(err)),
            },
        };

        match self.finalize(&job, &token).await {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::LeaseConflict => {
                self.inner.stats.lease_lost.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job.id, "Lease was reclaimed before the job finished; result discarded");
                return Ok(Some(ProcessOutcome::LeaseLost));
            }
            Err(e) => return Err(e),
        }

        match (&outcome, failure) {
            (ProcessOutcome::Completed, _) => {
                self.inner.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %job.id, "Job completed");
                self.emit(JobEvent::Completed {
                    job_id: job.id,
                    queue: job.queue.clone(),
                    result: job.result.clone().unwrap_or_default(),
                    at: now,
                });
            }
            (_, Some(err)) => {
                let will_retry = matches!(outcome, ProcessOutcome::Retrying { .. });
                if will_retry {
                    self.inner.stats.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(job_id = %job.id, attempts_made = job.attempts_made, error = %err, "Job attempt failed, will retry");
                } else {
                    self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(job_id = %job.id, attempts_made = job.attempts_made, error = %err, "Job failed");
                }
                self.emit(JobEvent::Failed {
                    job_id: job.id,
                    queue: job.queue.clone(),
                    error: err.to_string(),
                    attempts_made: job.attempts_made,
                    will_retry,
                    at: now,
                });
            }
            _ => {}
        }

        Ok(Some(outcome))
    }

    /// Persist an attempt's outcome, retrying transient store failures while
    /// the lease is held. A lease that lapses meanwhile surfaces as
    /// `LeaseConflict` from the store's compare-and-set.
    async fn finalize(&self, job: &Job, token: &str) -> Result<()> {
        let store = &self.inner.store;
        with_store_retry("finalize", || store.finalize(job, token)).await
    }

    /// Run the handler, renewing the lease at half its duration until the
    /// attempt finishes. A panic counts as a retryable failure.
    async fn run_with_lease(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: JobContext,
        id: JobId,
        token: &str,
    ) -> JobResult {
        let lease = self.inner.config.lease_duration;
        let renew_every = (lease / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let attempt = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                outcome = &mut attempt => {
                    return outcome.unwrap_or_else(|_| Err(JobError::retryable("job handler panicked")));
                }
                _ = ticker.tick() => {
                    let until = offset(self.inner.clock.now(), lease);
                    match self.inner.store.extend_lease(id, token, until).await {
                        Ok(true) => {}
                        Ok(false) => warn!(job_id = %id, "Lease lost while job was running"),
                        Err(e) => warn!(job_id = %id, error = %e, "Failed to extend lease"),
                    }
                }
            }
        }
    }

    /// Reclaim jobs of the registered queues whose lease has expired.
    /// Returns the number of jobs reclaimed.
    pub async fn recover_stalled(&self) -> Result<usize> {
        let mut recovered = 0;
        let max_stalled = self.inner.config.max_stalled_count;

        for queue in self.queues() {
            let now = self.inner.clock.now();
            for mut job in self.inner.store.expired_leases(&queue, now).await? {
                let Some(token) = job.lock_token.clone() else {
                    continue;
                };
                let failed = job.stall(max_stalled, now);

                match self.inner.store.finalize(&job, &token).await {
                    Ok(()) => {}
                    // The worker finished, or another sweeper got there first.
                    Err(e) if e.code() == ErrorCode::LeaseConflict => continue,
                    Err(e) => return Err(e),
                }

                recovered += 1;
                self.inner.stats.stalled.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %job.id,
                    queue = %queue,
                    stalled_count = job.stalled_count,
                    failed,
                    "Reclaimed stalled job"
                );
                self.emit(JobEvent::Stalled {
                    job_id: job.id,
                    queue: queue.clone(),
                    stalled_count: job.stalled_count,
                    failed,
                    at: now,
                });
                if failed {
                    self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                    self.emit(JobEvent::Failed {
                        job_id: job.id,
                        queue: queue.clone(),
                        error: job.last_error.clone().unwrap_or_default(),
                        attempts_made: job.attempts_made,
                        will_retry: false,
                        at: now,
                    });
                }
            }
        }

        Ok(recovered)
    }

    /// Spawn the poll loops and the stall sweeper. A pool starts once;
    /// shutting the handle down stops it for good.
    pub fn start(&self) -> Result<WorkerPoolHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TollgateError::shutting_down());
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TollgateError::new(
                ErrorCode::ConfigurationError,
                format!("Worker pool {} is already started", self.inner.instance_id),
            ));
        }

        let registrations: Vec<(String, HandlerOptions)> = self
            .inner
            .handlers
            .read()
            .iter()
            .map(|(queue, r)| (queue.clone(), r.options))
            .collect();

        let mut tasks = JoinSet::new();
        for (queue, options) in registrations {
            for slot in 0..options.concurrency {
                let pool = self.clone();
                let queue = queue.clone();
                let worker_id = format!("{}:{}:{}", self.inner.instance_id, queue, slot);
                tasks.spawn(async move { pool.poll_loop(queue, worker_id).await });
            }
        }

        let sweeper = self.clone();
        tasks.spawn(async move { sweeper.stall_loop().await });

        info!(
            instance = %self.inner.instance_id,
            tasks = tasks.len(),
            "Worker pool started"
        );

        Ok(WorkerPoolHandle {
            shutdown: self.inner.shutdown.clone(),
            tasks,
            drain_timeout: self.inner.config.drain_timeout,
        })
    }

    async fn poll_loop(self, queue: String, worker_id: String) {
        let token = self.inner.shutdown.clone();
        let poll_interval = self.inner.config.poll_interval;
        let mut failures = 0u32;
        debug!(queue = %queue, worker = %worker_id, "Poll loop started");

        while !token.is_cancelled() {
            let pause = match self.process_next(&queue, &worker_id).await {
                Ok(Some(_)) => {
                    failures = 0;
                    continue;
                }
                Ok(None) => {
                    failures = 0;
                    poll_interval
                }
                Err(e) if e.code() == ErrorCode::ShuttingDown => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(queue = %queue, worker = %worker_id, failures, error = %e, "Failed to process job");
                    poll_interval
                        .max(STORE_RETRY_BACKOFF.delay_for_attempt(failures))
                        .min(MAX_POLL_BACKOFF)
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!(queue = %queue, worker = %worker_id, "Poll loop stopped");
    }

    async fn stall_loop(self) {
        let token = self.inner.shutdown.clone();
        let mut interval = tokio::time::interval(self.inner.config.stall_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.recover_stalled().await {
                        warn!(error = %e, "Stall check failed");
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight job finished within the drain timeout
    pub drained: bool,
    /// Tasks still running when the timeout passed
    pub aborted: usize,
}

/// Handle for stopping a started [`WorkerPool`].
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    drain_timeout: Duration,
}

impl WorkerPoolHandle {
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop claiming jobs, signal running handlers, and wait up to
    /// `drain_timeout` for in-flight jobs. Jobs still running afterwards are
    /// aborted; their leases expire and they are reclaimed as stalled.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> ShutdownReport {
        info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "Worker pool shutting down");
        self.shutdown.cancel();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let mut aborted = 0;
        if !drained {
            aborted = self.tasks.len();
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            warn!(aborted, "Drain timeout elapsed; aborted in-flight jobs");
        }

        info!(drained, "Worker pool stopped");
        ShutdownReport { drained, aborted }
    }

    /// [`shutdown`](Self::shutdown) with the configured drain timeout.
    pub async fn stop(self) -> ShutdownReport {
        let timeout = self.drain_timeout;
        self.shutdown(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::jobs::job::{JobOptions, JobState};
    use crate::jobs::queue::JobQueue;
    use crate::jobs::store::InMemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn setup() -> (JobQueue, WorkerPool) {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());
        let queue = JobQueue::new(store.clone(), clock.clone());
        let pool = WorkerPool::new(store, WorkerConfig::default(), clock);
        (queue, pool)
    }

    #[test]
    fn test_config_from_settings() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.max_stalled_count, 1);
    }

    #[test]
    fn test_register_rejects_zero_concurrency() {
        let (_, pool) = setup();
        let handler = handler_fn(|_ctx| async { Ok(json!(null)) });
        let err = pool
            .register_handler("email", handler, HandlerOptions::new(0))
            .unwrap_err();
        assert_eq!(err.field(), Some("concurrency"));
    }

    #[tokio::test]
    async fn test_process_without_handler() {
        let (_, pool) = setup();
        let err = pool.process_next("email", "w").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoHandlerRegistered);
    }

    #[tokio::test]
    async fn test_process_empty_queue() {
        let (_, pool) = setup();
        pool.register_handler("email", handler_fn(|_ctx| async { Ok(json!(null)) }), HandlerOptions::default())
            .unwrap();
        assert_eq!(pool.process_next("email", "w").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_completed_job_stores_result() {
        let (queue, pool) = setup();
        pool.register_handler(
            "email",
            handler_fn(|ctx| async move { Ok(json!({"echo": ctx.payload().clone()})) }),
            HandlerOptions::default(),
        )
        .unwrap();

        let id = queue.enqueue("email", json!("hi"), JobOptions::default()).await.unwrap();
        let outcome = pool.process_next("email", "w").await.unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::Completed));

        let job = queue.require(id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(json!({"echo": "hi"})));
        assert_eq!(pool.stats().completed(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried() {
        let (queue, pool) = setup();
        pool.register_handler(
            "email",
            handler_fn(|_ctx| async move {
                if true {
                    panic!("handler bug");
                }
                Ok(json!(null))
            }),
            HandlerOptions::default(),
        )
        .unwrap();

        let id = queue.enqueue("email", json!({}), JobOptions::new().attempts(2)).await.unwrap();
        let outcome = pool.process_next("email", "w").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { .. }));

        let job = queue.require(id).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.last_error.as_deref(), Some("job handler panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_retry_only_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let value = with_store_retry("claim_next", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TollgateError::store_timeout("claim_next"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);

        let calls = AtomicU32::new(0);
        let err = with_store_retry("finalize", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TollgateError::new(ErrorCode::LeaseConflict, "lease lost")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseConflict);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let err = with_store_retry("finalize", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TollgateError::store_timeout("finalize")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreTimeout);
        assert_eq!(calls.load(Ordering::SeqCst), STORE_RETRIES + 1);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1550) && waited < Duration::from_secs(2));
    }
}
