//! Background Training Jobs
//!
//! A FIFO queue drained by a fixed pool of workers, a progress store with
//! per-job cancellation flags, and a durable record of every job.

pub mod inference;
pub mod progress;
pub mod queue;
pub mod service;
pub mod store;
pub mod training;

pub use inference::{ModelError, Predictions, SavedRules, TrainedModel};
pub use progress::{CancellationFlag, ProgressSnapshot, ProgressStore, StopOutcome};
pub use queue::{JobFn, JobObserver, LoggingObserver, WorkerPool};
pub use service::{JobContext, JobStats, TrainingService};
pub use store::{JobStore, MemoryJobStore, SqliteJobStore};
pub use training::{RawDataset, TrainingParams, TrainingRequest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error | JobStatus::Stopped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "error" => JobStatus::Error,
            "stopped" => JobStatus::Stopped,
            _ => JobStatus::Pending,
        }
    }
}

/// Durable record of one job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub detail: Option<Value>,
}

impl TrainingJob {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            message: None,
            detail: None,
        }
    }
}

/// How a job body ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { detail: Value },
    /// Cancellation was observed before `epoch`
    Stopped { epoch: usize },
}

/// Failure of a job body, caught at the worker boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobExecutionError {
    #[error("{0}")]
    Failed(String),
    #[error("job panicked: {0}")]
    Panicked(String),
}
