//! Job lifecycle events published by the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A worker leased the job and started an attempt.
    Active {
        job_id: JobId,
        queue: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    Completed {
        job_id: JobId,
        queue: String,
        result: serde_json::Value,
        at: DateTime<Utc>,
    },
    /// An attempt failed. `will_retry` is false once the job is terminal.
    Failed {
        job_id: JobId,
        queue: String,
        error: String,
        attempts_made: u32,
        will_retry: bool,
        at: DateTime<Utc>,
    },
    /// The job's lease expired and it was reclaimed.
    Stalled {
        job_id: JobId,
        queue: String,
        stalled_count: u32,
        failed: bool,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Active { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. } => *job_id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::Active { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Stalled { queue, .. } => queue,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Active { .. } => "active",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
        }
    }
}
