//! The `JobManager` trait: the contract every backend must fulfil.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{JobError, JobSpec};

/// Transient status of a backend job, as reported by `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted by the backend but not started yet.
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether the backend signalled completion (either way).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Uniform launch/poll/cancel contract over one execution backend.
///
/// Implementations own no domain state. They must treat a duplicate
/// `launch` for the same `name` as a no-op, and `poll` must never block on
/// the job itself; callers poll on their own schedule.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Short backend name, used in logs.
    fn kind(&self) -> &'static str;

    /// Start the job described by `spec` under `name`.
    async fn launch(&self, name: &str, spec: &JobSpec) -> Result<(), JobError>;

    /// Current status of job `name`, or [`JobError::NotExist`].
    async fn poll(&self, name: &str) -> Result<JobStatus, JobError>;

    /// Ask the backend to stop job `name`. Best effort.
    async fn cancel(&self, name: &str) -> Result<(), JobError>;
}
