//! Job-level error type.

use thiserror::Error;

/// Errors returned by a [`JobManager`](crate::JobManager).
///
/// `NotExist` is an expected outcome of `poll`, not a failure: the job was
/// never launched, or the backend already garbage-collected it.
#[derive(Debug, Error)]
pub enum JobError {
    /// The backend has no record of this job.
    #[error("job '{0}' does not exist")]
    NotExist(String),

    /// The backend refused or failed to start the job.
    #[error("failed to launch job '{job}': {message}")]
    Launch { job: String, message: String },

    /// The backend could not report the job's status.
    #[error("failed to poll job '{job}': {message}")]
    Poll { job: String, message: String },

    /// The cancellation signal could not be delivered.
    #[error("failed to cancel job '{job}': {message}")]
    Cancel { job: String, message: String },

    /// The job spec could not be serialized for the backend.
    #[error("job spec serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl JobError {
    /// Whether this is the first-class "job does not exist" outcome.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::NotExist(_))
    }
}
