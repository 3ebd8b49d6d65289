//! Job records and their state machine.
//!
//! - **Job**: the durable record of one unit of work
//! - **JobState**: `Waiting`, `Delayed`, `Active`, `Completed`, `Failed`
//! - **JobOptions**: priority, initial delay, attempts and backoff
//! - **JobContext**: what a handler sees while it runs
//!
//! Transitions are pure methods on [`Job`]; stores persist their result with
//! a compare-and-set on the lease token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::offset;
use crate::error::{Result, TollgateError};

/// Bound on the magnitude of a job priority.
pub const MAX_PRIORITY: i32 = 1 << 21;

/// Upper bound on an initial delay, a backoff base and any computed retry delay.
pub const MAX_DELAY_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Error recorded when a job exceeds its stall allowance.
pub const STALLED_ERROR: &str = "job stalled more than allowable limit";

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TollgateError::validation("id", format!("'{}' is not a valid job id", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible now
    Waiting,
    /// Eligible once `available_at` passes
    Delayed,
    /// Leased by a worker
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TollgateError::internal(format!("unknown job state '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for handler failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// A non-retryable error fails the job regardless of remaining attempts
    pub retryable: bool,
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<TollgateError> for JobError {
    fn from(error: TollgateError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::fatal(format!("invalid payload: {}", error))
    }
}

/// Result type returned by handlers.
pub type JobResult = std::result::Result<serde_json::Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay
    Fixed,
    /// `base_delay_ms * 2^(attempt - 1)`
    Exponential,
}

/// Delay before a failed job is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    #[serde(rename = "delay")]
    pub base_delay_ms: i64,
}

impl BackoffPolicy {
    pub const fn fixed(delay_ms: i64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms: delay_ms,
        }
    }

    pub const fn exponential(base_delay_ms: i64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed). Saturates instead of
    /// overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.max(0) as u64;
        let ms = match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exponent = attempt.max(1) - 1;
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer-supplied options for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Higher is served first
    pub priority: i32,
    /// Milliseconds before the job first becomes eligible
    #[serde(rename = "delay")]
    pub delay_ms: i64,
    /// Total attempts, including the first
    #[serde(rename = "attempts")]
    pub max_attempts: u32,
    /// Absent means retry immediately
    pub backoff: Option<BackoffPolicy>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            max_attempts: 1,
            backoff: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Priority 10, first run after 5s, three attempts, exponential backoff
    /// from 2s. Used by the demo producer; the CLI flag defaults match.
    pub fn standard() -> Self {
        Self {
            priority: 10,
            delay_ms: 5000,
            max_attempts: 3,
            backoff: Some(BackoffPolicy::exponential(2000)),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis().min(i64::MAX as u128) as i64;
        self
    }

    pub fn attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Reject options that could never be honoured.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(TollgateError::validation(
                "attempts",
                "attempts must be at least 1",
            ));
        }
        if self.delay_ms < 0 {
            return Err(TollgateError::validation("delay", "delay must not be negative"));
        }
        if self.delay_ms > MAX_DELAY_MS {
            return Err(TollgateError::validation(
                "delay",
                format!("delay must be at most {}ms", MAX_DELAY_MS),
            ));
        }
        if self.priority.unsigned_abs() > MAX_PRIORITY as u32 {
            return Err(TollgateError::validation(
                "priority",
                format!("priority must be within ±{}", MAX_PRIORITY),
            ));
        }
        if let Some(backoff) = &self.backoff {
            if backoff.base_delay_ms < 0 {
                return Err(TollgateError::validation(
                    "backoff.delay",
                    "backoff delay must not be negative",
                ));
            }
            if backoff.base_delay_ms > MAX_DELAY_MS {
                return Err(TollgateError::validation(
                    "backoff.delay",
                    format!("backoff delay must be at most {}ms", MAX_DELAY_MS),
                ));
            }
        }
        Ok(())
    }

    /// Delay before the next attempt after `attempts_made` failures, capped
    /// at [`MAX_DELAY_MS`].
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .map(|b| b.delay_for_attempt(attempts_made))
            .unwrap_or(Duration::ZERO)
            .min(Duration::from_millis(MAX_DELAY_MS as u64))
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            payload,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// The durable record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    /// Finished attempts, successful or not
    pub attempts_made: u32,
    /// Times the job was reclaimed from a worker whose lease expired
    pub stalled_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    #[serde(skip_serializing)]
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    /// Store-assigned FIFO tie-breaker
    pub seq: u64,
}

/// What a failed attempt led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Delayed`, eligible at the given time
    Retry { at: DateTime<Utc> },
    /// Terminal `Failed`
    Exhausted,
}

impl Job {
    /// A freshly enqueued job: `Waiting`, or `Delayed` when the options carry a delay.
    pub fn new(
        queue: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
        seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let delayed = options.delay_ms > 0;
        let delay = options.delay_ms.clamp(0, MAX_DELAY_MS) as u64;
        let available_at = offset(now, Duration::from_millis(delay));
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            options,
            state: if delayed { JobState::Delayed } else { JobState::Waiting },
            attempts_made: 0,
            stalled_count: 0,
            last_error: None,
            created_at: now,
            available_at,
            locked_by: None,
            lock_token: None,
            lock_expires_at: None,
            started_at: None,
            finished_at: None,
            result: None,
            seq,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.available_at <= now,
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lock_expires_at.map(|t| t <= now).unwrap_or(true)
    }

    /// `Waiting`/`Delayed` → `Active` under a new lease.
    pub fn claim(&mut self, worker_id: &str, token: &str, lease: Duration, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.locked_by = Some(worker_id.to_string());
        self.lock_token = Some(token.to_string());
        self.lock_expires_at = Some(offset(now, lease));
        self.started_at = Some(now);
    }

    /// `Active` → `Completed`.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.attempts_made += 1;
        self.state = JobState::Completed;
        self.result = Some(result);
        self.finished_at = Some(now);
        self.release();
    }

    /// `Active` → `Delayed` for another attempt, or `Failed` once attempts
    /// are exhausted or the error is fatal.
    pub fn fail(&mut self, error: &JobError, now: DateTime<Utc>) -> FailureOutcome {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        self.release();

        if error.retryable && self.attempts_made < self.options.max_attempts {
            let at = offset(now, self.options.retry_delay(self.attempts_made));
            self.state = JobState::Delayed;
            self.available_at = at;
            FailureOutcome::Retry { at }
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            FailureOutcome::Exhausted
        }
    }

    /// Reclaim from a worker whose lease expired. Returns true if the job
    /// was failed for stalling too often.
    pub fn stall(&mut self, max_stalled_count: u32, now: DateTime<Utc>) -> bool {
        self.stalled_count += 1;
        self.release();

        if self.stalled_count > max_stalled_count {
            self.state = JobState::Failed;
            self.last_error = Some(STALLED_ERROR.to_string());
            self.finished_at = Some(now);
            true
        } else {
            self.state = JobState::Waiting;
            false
        }
    }

    fn release(&mut self) {
        self.locked_by = None;
        self.lock_token = None;
        self.lock_expires_at = None;
    }

    /// FIFO tie-breaker within one priority: zero-padded sequence, then id.
    /// Priority itself is ordered by the store (ZSET score, index key).
    pub fn rank(&self) -> String {
        format!("{:020}:{}", self.seq, self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    worker_id: String,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, worker_id: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            job,
            worker_id: worker_id.into(),
            cancellation,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Deserialize the payload; a malformed payload is a fatal error.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made + 1
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// True once the pool has begun shutting down.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the pool begins shutting down.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Run a future unless shutdown begins first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            queue = %self.job.queue,
            attempt = self.attempt(),
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn job_with(options: JobOptions) -> Job {
        Job::new("email", serde_json::json!({"to": "a@b.c"}), options, 1, Utc::now())
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert_eq!("nope".parse::<JobId>().unwrap_err().field(), Some("id"));
    }

    #[test]
    fn test_backoff_exponential() {
        let backoff = BackoffPolicy::exponential(2000);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(backoff.delay_for_attempt(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = BackoffPolicy::fixed(750);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(750));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_millis(750));
    }

    #[test]
    fn test_options_validation() {
        assert!(JobOptions::default().validate().is_ok());

        let err = JobOptions::new().attempts(0).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.field(), Some("attempts"));

        let negative = JobOptions {
            delay_ms: -1,
            ..JobOptions::default()
        };
        assert_eq!(negative.validate().unwrap_err().field(), Some("delay"));

        let too_high = JobOptions::new().priority(MAX_PRIORITY + 1);
        assert_eq!(too_high.validate().unwrap_err().field(), Some("priority"));
        assert!(JobOptions::new().priority(-MAX_PRIORITY).validate().is_ok());
    }

    #[test]
    fn test_options_reject_unbounded_delays() {
        let far = JobOptions {
            delay_ms: MAX_DELAY_MS + 1,
            ..JobOptions::default()
        };
        assert_eq!(far.validate().unwrap_err().field(), Some("delay"));

        let backoff = JobOptions::new().backoff(BackoffPolicy::fixed(i64::MAX));
        assert_eq!(backoff.validate().unwrap_err().field(), Some("backoff.delay"));

        let edge = JobOptions::new()
            .delay(Duration::from_millis(MAX_DELAY_MS as u64))
            .backoff(BackoffPolicy::fixed(MAX_DELAY_MS));
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_standard_options() {
        let options = JobOptions::standard();
        assert!(options.validate().is_ok());
        assert_eq!(options.retry_delay(1), Duration::from_millis(2000));
        assert_eq!(options.retry_delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let options = JobOptions::new().attempts(100).backoff(BackoffPolicy::exponential(2000));
        let cap = Duration::from_millis(MAX_DELAY_MS as u64);
        assert_eq!(options.retry_delay(43), cap);
        assert_eq!(options.retry_delay(99), cap);
    }

    #[test]
    fn test_long_backoff_does_not_overflow_time() {
        let mut job = job_with(JobOptions::new().attempts(100).backoff(BackoffPolicy::exponential(2000)));
        let now = Utc::now();
        job.attempts_made = 60;

        job.claim("w1", "t1", Duration::from_secs(30), now);
        match job.fail(&JobError::retryable("smtp down"), now) {
            FailureOutcome::Retry { at } => {
                assert_eq!(at, now + chrono::Duration::milliseconds(MAX_DELAY_MS));
            }
            other => panic!("expected a retry, got {:?}", other),
        }
    }

    #[test]
    fn test_unvalidated_delay_is_clamped() {
        let now = Utc::now();
        let job = Job::new(
            "email",
            serde_json::Value::Null,
            JobOptions {
                delay_ms: i64::MAX,
                ..JobOptions::default()
            },
            1,
            now,
        );
        assert_eq!(job.available_at, now + chrono::Duration::milliseconds(MAX_DELAY_MS));
    }

    #[test]
    fn test_options_wire_names() {
        let options: JobOptions = serde_json::from_value(serde_json::json!({
            "priority": 10,
            "delay": 5000,
            "attempts": 3,
            "backoff": { "type": "exponential", "delay": 2000 }
        }))
        .unwrap();

        assert_eq!(options.priority, 10);
        assert_eq!(options.delay_ms, 5000);
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.backoff, Some(BackoffPolicy::exponential(2000)));
    }

    #[test]
    fn test_delayed_job_eligibility() {
        let now = Utc::now();
        let job = Job::new(
            "email",
            serde_json::Value::Null,
            JobOptions::new().delay(Duration::from_secs(5)),
            1,
            now,
        );
        assert_eq!(job.state, JobState::Delayed);
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_fail_retries_then_exhausts() {
        let mut job = job_with(JobOptions::new().attempts(2).backoff(BackoffPolicy::fixed(1000)));
        let now = Utc::now();

        job.claim("w1", "t1", Duration::from_secs(30), now);
        let outcome = job.fail(&JobError::retryable("smtp down"), now);
        assert_eq!(
            outcome,
            FailureOutcome::Retry {
                at: now + chrono::Duration::seconds(1)
            }
        );
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.lock_token.is_none());

        job.claim("w1", "t2", Duration::from_secs(30), now);
        assert_eq!(job.fail(&JobError::retryable("smtp down"), now), FailureOutcome::Exhausted);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.last_error.as_deref(), Some("smtp down"));
    }

    #[test]
    fn test_fatal_error_skips_retries() {
        let mut job = job_with(JobOptions::new().attempts(5));
        let now = Utc::now();
        job.claim("w1", "t1", Duration::from_secs(30), now);
        assert_eq!(job.fail(&JobError::fatal("bad address"), now), FailureOutcome::Exhausted);
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn test_stall_limit() {
        let mut job = job_with(JobOptions::default());
        let now = Utc::now();

        job.claim("w1", "t1", Duration::from_secs(1), now);
        assert!(job.lease_expired(now + chrono::Duration::seconds(1)));
        assert!(!job.stall(1, now));
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);

        job.claim("w2", "t2", Duration::from_secs(1), now);
        assert!(job.stall(1, now));
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some(STALLED_ERROR));
    }

    #[test]
    fn test_rank_orders_by_sequence() {
        let mut a = job_with(JobOptions::default());
        let mut b = job_with(JobOptions::default());
        a.seq = 9;
        b.seq = 10;
        assert!(a.rank() < b.rank());
    }
}
