//! Producer-side queue API.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::job::{Job, JobId, JobOptions, JobState, NewJob};
use super::store::{InMemoryJobStore, JobCounts, JobStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::telemetry::JobMetrics;

const MAX_QUEUE_NAME_LEN: usize = 128;

/// Queue names are short identifiers safe to embed in store keys.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return Err(TollgateError::validation(
            "queue",
            format!("queue name must be 1-{} characters", MAX_QUEUE_NAME_LEN),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(TollgateError::validation(
            "queue",
            "queue name may only contain letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(())
}

/// Counts for every known queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealthReport {
    pub queues: BTreeMap<String, JobCounts>,
    pub checked_at: DateTime<Utc>,
}

/// Handle used by producers to enqueue and inspect jobs.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &self.store.name())
            .finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Queue over an in-memory store and the system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryJobStore::new()), Arc::new(SystemClock))
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Validate and persist a job. Returns its id.
    #[instrument(skip(self, payload, options), fields(queue = %queue))]
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        validate_queue_name(queue)?;
        options.validate()?;

        let seq = self.store.next_sequence().await?;
        let job = Job::new(queue, payload, options, seq, self.clock.now());
        self.store.insert(&job).await?;

        JobMetrics::event(queue, "enqueued");
        debug!(job_id = %job.id, state = %job.state, "Job enqueued");
        Ok(job.id)
    }

    /// Enqueue many jobs concurrently. Results line up with the input; one
    /// invalid job does not abort the others.
    pub async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> Vec<Result<JobId>> {
        join_all(
            jobs.into_iter()
                .map(|job| async move { self.enqueue(&job.queue, job.payload, job.options).await }),
        )
        .await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    /// Like [`get`](Self::get), but a missing job is an error.
    pub async fn require(&self, id: JobId) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TollgateError::job_not_found(id))
    }

    /// Delete a job that is not active.
    pub async fn remove(&self, id: JobId) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        if removed {
            debug!(job_id = %id, "Job removed");
        }
        Ok(removed)
    }

    pub async fn counts(&self, queue: &str) -> Result<JobCounts> {
        validate_queue_name(queue)?;
        self.store.counts(queue).await
    }

    /// Counts for every known queue; also refreshes the queue depth gauges.
    pub async fn health(&self) -> Result<QueueHealthReport> {
        let mut queues = BTreeMap::new();
        for name in self.store.queues().await? {
            let counts = self.store.counts(&name).await?;
            for state in JobState::ALL {
                JobMetrics::queue_depth(&name, state.as_str(), counts.get(state));
            }
            queues.insert(name, counts);
        }

        Ok(QueueHealthReport {
            queues,
            checked_at: self.clock.now(),
        })
    }
}
