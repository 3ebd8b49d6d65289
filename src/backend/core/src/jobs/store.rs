//! Durable job storage.
//!
//! Every transition out of `Active` goes through [`JobStore::finalize`], a
//! compare-and-set on the lease token. A worker whose lease was reclaimed
//! therefore cannot overwrite the job's newer state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

use super::job::{Job, JobId, JobState};
use crate::error::{ErrorCode, Result, TollgateError};

/// Number of jobs per state in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    fn bump(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

pub(crate) fn job_active(id: JobId) -> TollgateError {
    TollgateError::new(
        ErrorCode::JobActive,
        format!("Job {} is active and cannot be removed", id),
    )
}

/// Persistence for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Monotonic sequence used as the FIFO tie-breaker.
    async fn next_sequence(&self) -> Result<u64>;

    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically promote due delayed jobs, then lease the highest-priority
    /// eligible job of `queue` (FIFO within a priority). No job is ever
    /// handed to two claimers.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Persist a transition out of `Active`. Fails with `LeaseConflict`
    /// unless the stored job is still `Active` under `expected_token`.
    async fn finalize(&self, job: &Job, expected_token: &str) -> Result<()>;

    /// Push the lease expiry forward. Returns false if the lease is no
    /// longer held.
    async fn extend_lease(&self, id: JobId, token: &str, until: DateTime<Utc>) -> Result<bool>;

    /// Active jobs of `queue` whose lease has expired.
    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Delete a non-active job. Returns false if the job does not exist.
    async fn remove(&self, id: JobId) -> Result<bool>;

    async fn counts(&self, queue: &str) -> Result<JobCounts>;

    /// Every queue that has ever received a job.
    async fn queues(&self) -> Result<Vec<String>>;

    fn name(&self) -> &'static str;
}

pub(crate) fn new_lease_token() -> String {
    Uuid::new_v4().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct QueueIndex {
    /// (-priority, seq, id)
    waiting: BTreeSet<(i64, u64, JobId)>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
}

impl QueueIndex {
    fn index(&mut self, job: &Job) {
        match job.state {
            JobState::Waiting => {
                self.waiting.insert(waiting_key(job));
            }
            JobState::Delayed => {
                self.delayed.insert((job.available_at, job.id));
            }
            _ => {}
        }
    }

    fn unindex(&mut self, job: &Job) {
        self.waiting.remove(&waiting_key(job));
        self.delayed.remove(&(job.available_at, job.id));
    }
}

fn waiting_key(job: &Job) -> (i64, u64, JobId) {
    (-(job.options.priority as i64), job.seq, job.id)
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    queues: BTreeMap<String, QueueIndex>,
    seq: u64,
}

/// Process-local [`JobStore`] for tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn next_sequence(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        Ok(inner.seq)
    }

    async fn insert(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(TollgateError::internal(format!("job {} already exists", job.id)));
        }
        inner.queues.entry(job.queue.clone()).or_default().index(job);
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(index) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        while let Some(&(at, id)) = index.delayed.first() {
            if at > now {
                break;
            }
            index.delayed.remove(&(at, id));
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                index.waiting.insert(waiting_key(job));
            }
        }

        let Some(key) = index.waiting.pop_first() else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&key.2) else {
            return Ok(None);
        };

        job.claim(worker_id, &new_lease_token(), lease, now);
        Ok(Some(job.clone()))
    }

    async fn finalize(&self, job: &Job, expected_token: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| TollgateError::job_not_found(job.id))?;

        if stored.state != JobState::Active || stored.lock_token.as_deref() != Some(expected_token) {
            return Err(TollgateError::lease_conflict(job.id));
        }

        *stored = job.clone();
        inner.queues.entry(job.queue.clone()).or_default().index(job);
        Ok(())
    }

    async fn extend_lease(&self, id: JobId, token: &str, until: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Active && job.lock_token.as_deref() == Some(token) => {
                job.lock_expires_at = Some(until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        let mut expired: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|job| job.seq);
        Ok(expired)
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(job) = inner.jobs.get(&id) else {
            return Ok(false);
        };
        if job.state == JobState::Active {
            return Err(job_active(id));
        }
        if let Some(index) = inner.queues.get_mut(&job.queue) {
            index.unindex(job);
        }
        inner.jobs.remove(&id);
        Ok(true)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let inner = self.inner.lock();
        let mut counts = JobCounts::default();
        for job in inner.jobs.values().filter(|job| job.queue == queue) {
            counts.bump(job.state);
        }
        Ok(counts)
    }

    async fn queues(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().queues.keys().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobError, JobOptions};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    async fn enqueue(store: &InMemoryJobStore, options: JobOptions, now: DateTime<Utc>) -> Job {
        let seq = store.next_sequence().await.unwrap();
        let job = Job::new("email", json!({}), options, seq, now);
        store.insert(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let low = enqueue(&store, JobOptions::new().priority(1), now).await;
        let high_a = enqueue(&store, JobOptions::new().priority(10), now).await;
        let high_b = enqueue(&store, JobOptions::new().priority(10), now).await;

        let mut order = Vec::new();
        while let Some(job) = store.claim_next("email", "w", LEASE, now).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![high_a.id, high_b.id, low.id]);
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_early() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = enqueue(&store, JobOptions::new().delay(Duration::from_secs(5)), now).await;

        assert!(store.claim_next("email", "w", LEASE, now).await.unwrap().is_none());
        let later = now + chrono::Duration::seconds(5);
        let claimed = store.claim_next("email", "w", LEASE, later).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Active);
    }

    #[tokio::test]
    async fn test_stale_finalize_rejected() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        enqueue(&store, JobOptions::default(), now).await;

        let slow = store.claim_next("email", "slow", LEASE, now).await.unwrap().unwrap();
        let slow_token = slow.lock_token.clone().unwrap();

        let later = now + chrono::Duration::seconds(31);
        let mut reclaimed = store.expired_leases("email", later).await.unwrap().remove(0);
        reclaimed.stall(1, later);
        store.finalize(&reclaimed, &slow_token).await.unwrap();

        let fresh = store.claim_next("email", "fresh", LEASE, later).await.unwrap().unwrap();
        assert_eq!(fresh.stalled_count, 1);

        let mut late = slow.clone();
        late.complete(json!("late"), later);
        let err = store.finalize(&late, &slow_token).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseConflict);

        let stored = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);
        assert_eq!(stored.locked_by.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_retry_reindexes_as_delayed() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        enqueue(&store, JobOptions::new().attempts(2), now).await;

        let mut job = store.claim_next("email", "w", LEASE, now).await.unwrap().unwrap();
        let token = job.lock_token.clone().unwrap();
        job.fail(&JobError::retryable("boom"), now);
        store.finalize(&job, &token).await.unwrap();

        let counts = store.counts("email").await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert!(store.claim_next("email", "w", LEASE, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_refuses_active() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let waiting = enqueue(&store, JobOptions::new().priority(-1), now).await;
        let active_job = enqueue(&store, JobOptions::new().priority(5), now).await;
        store.claim_next("email", "w", LEASE, now).await.unwrap();

        let err = store.remove(active_job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobActive);

        assert!(store.remove(waiting.id).await.unwrap());
        assert!(!store.remove(waiting.id).await.unwrap());
        assert!(store.claim_next("email", "w", LEASE, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counts_and_queues() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        enqueue(&store, JobOptions::default(), now).await;
        enqueue(&store, JobOptions::new().delay(Duration::from_secs(60)), now).await;
        store.claim_next("email", "w", LEASE, now).await.unwrap();

        let counts = store.counts("email").await.unwrap();
        assert_eq!(
            counts,
            JobCounts {
                waiting: 0,
                delayed: 1,
                active: 1,
                completed: 0,
                failed: 0
            }
        );
        assert_eq!(store.queues().await.unwrap(), vec!["email".to_string()]);
        assert_eq!(store.counts("other").await.unwrap().total(), 0);
    }
}
