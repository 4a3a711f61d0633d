//! Execution state of an operator, artifact or DAG run.
//!
//! The operator state is assembled from two racy sources: the ephemeral
//! job-manager status and the metadata blob the worker writes to storage.
//! [`derive_state`] folds one observation of each into a single answer and
//! has no side effects, so every combination is unit-testable.

use chrono::{DateTime, Utc};
use db::models::ExecutionStatus;
use jobs::JobStatus;
use serde::{Deserialize, Serialize};

/// Shown to users for failures that are not their fault. Internals stay in
/// the logs and the `context` field.
pub const TIP_UNKNOWN_INTERNAL_ERROR: &str =
    "Sorry, we've run into an unexpected error! Please check the server logs for details.";

pub const TIP_UPSTREAM_FAILED: &str =
    "An upstream operator failed, so this operator was not run.";

pub const TIP_CANCELED: &str = "The run was canceled before this operator completed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The user's computation raised.
    User,
    /// Anything else: backend, storage, malformed metadata.
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub tip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogs {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTimestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Snapshot of where an execution stands.
///
/// `failure_type` is only set when `status` is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_logs: Option<UserLogs>,
    #[serde(default)]
    pub timestamps: ExecutionTimestamps,
}

impl ExecutionState {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            failure_type: None,
            error: None,
            user_logs: None,
            timestamps: ExecutionTimestamps::default(),
        }
    }

    pub fn pending() -> Self {
        Self::new(ExecutionStatus::Pending)
    }

    pub fn running() -> Self {
        Self::new(ExecutionStatus::Running)
    }

    pub fn canceled(context: impl Into<String>, tip: impl Into<String>) -> Self {
        Self {
            error: Some(ExecError { context: context.into(), tip: tip.into() }),
            ..Self::new(ExecutionStatus::Canceled)
        }
    }

    /// A `Failed/System` state carrying a diagnostic context and the
    /// generic tip.
    pub fn system_failure(context: impl Into<String>) -> Self {
        Self {
            failure_type: Some(FailureType::System),
            error: Some(ExecError {
                context: context.into(),
                tip: TIP_UNKNOWN_INTERNAL_ERROR.to_owned(),
            }),
            ..Self::new(ExecutionStatus::Failed)
        }
    }

    pub fn user_failure(context: impl Into<String>, tip: impl Into<String>) -> Self {
        Self {
            failure_type: Some(FailureType::User),
            error: Some(ExecError { context: context.into(), tip: tip.into() }),
            ..Self::new(ExecutionStatus::Failed)
        }
    }

    /// Succeeded, Failed or Canceled.
    pub fn terminated(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_system_failure(&self) -> bool {
        self.status == ExecutionStatus::Failed && self.failure_type == Some(FailureType::System)
    }

    /// Stamp the timestamp matching the current status, keeping any earlier
    /// stamps from `previous`.
    pub fn stamped(mut self, previous: &ExecutionTimestamps, now: DateTime<Utc>) -> Self {
        let ts = &mut self.timestamps;
        ts.registered_at = ts.registered_at.or(previous.registered_at);
        ts.pending_at = ts.pending_at.or(previous.pending_at);
        ts.running_at = ts.running_at.or(previous.running_at);
        ts.finished_at = ts.finished_at.or(previous.finished_at);

        let slot = match self.status {
            ExecutionStatus::Registered => &mut ts.registered_at,
            ExecutionStatus::Pending    => &mut ts.pending_at,
            ExecutionStatus::Running    => &mut ts.running_at,
            ExecutionStatus::Succeeded
            | ExecutionStatus::Failed
            | ExecutionStatus::Canceled => &mut ts.finished_at,
        };
        slot.get_or_insert(now);
        self
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// What the job manager said about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobObservation {
    /// Never launched, or already garbage-collected.
    NotExist,
    Status(JobStatus),
    /// The poll itself failed.
    PollFailed(String),
}

impl JobObservation {
    /// Whether [`derive_state`] looks at the metadata blob for this
    /// observation. Callers can skip the storage read otherwise.
    pub fn needs_metadata(&self) -> bool {
        match self {
            Self::NotExist => true,
            Self::Status(status) => status.is_terminal(),
            Self::PollFailed(_) => false,
        }
    }
}

/// What storage said about the operator metadata blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataBlob {
    Absent,
    Present(Vec<u8>),
    /// The existence check or the read failed.
    Unreadable(String),
}

/// Fold one job observation and one metadata observation into a state.
///
/// Never fails: anything unexpected becomes `Failed/System`. When the job is
/// gone but the blob exists, the blob wins, so an operator whose job was
/// garbage-collected is never lost.
pub fn derive_state(job: &JobObservation, blob: &MetadataBlob) -> ExecutionState {
    match job {
        JobObservation::PollFailed(err) => {
            ExecutionState::system_failure(format!("Unable to poll job manager: {err}"))
        }
        JobObservation::NotExist => match blob {
            MetadataBlob::Absent => ExecutionState::pending(),
            MetadataBlob::Present(bytes) => parse_blob(bytes),
            MetadataBlob::Unreadable(err) => ExecutionState::system_failure(format!(
                "Unable to check operator metadata for a job that does not exist: {err}"
            )),
        },
        JobObservation::Status(status) if status.is_terminal() => match blob {
            MetadataBlob::Present(bytes) => parse_blob(bytes),
            MetadataBlob::Absent => ExecutionState::system_failure(
                "Job finished without writing operator metadata; \
                 it may have crashed before reporting its result.",
            ),
            MetadataBlob::Unreadable(err) => ExecutionState::system_failure(format!(
                "Unable to read operator metadata: {err}"
            )),
        },
        JobObservation::Status(_) => ExecutionState::running(),
    }
}

fn parse_blob(bytes: &[u8]) -> ExecutionState {
    match serde_json::from_slice::<ExecutionState>(bytes) {
        Ok(state) => state,
        Err(err) => {
            ExecutionState::system_failure(format!("Operator metadata is malformed: {err}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(state: &ExecutionState) -> MetadataBlob {
        MetadataBlob::Present(serde_json::to_vec(state).unwrap())
    }

    #[test]
    fn missing_job_without_blob_is_pending() {
        let state = derive_state(&JobObservation::NotExist, &MetadataBlob::Absent);
        assert_eq!(state.status, ExecutionStatus::Pending);
        assert!(state.failure_type.is_none());
    }

    #[test]
    fn missing_job_with_blob_returns_blob_state() {
        let written = ExecutionState::user_failure("boom", "fix your code");
        let state = derive_state(&JobObservation::NotExist, &blob(&written));
        assert_eq!(state, written);
    }

    #[test]
    fn terminal_job_without_blob_is_system_failure() {
        for status in [JobStatus::Succeeded, JobStatus::Failed] {
            let state = derive_state(&JobObservation::Status(status), &MetadataBlob::Absent);
            assert!(state.is_system_failure(), "{status:?}");
            assert_eq!(state.error.unwrap().tip, TIP_UNKNOWN_INTERNAL_ERROR);
        }
    }

    #[test]
    fn terminal_job_with_malformed_blob_is_system_failure() {
        let state = derive_state(
            &JobObservation::Status(JobStatus::Succeeded),
            &MetadataBlob::Present(b"{not json".to_vec()),
        );
        assert!(state.is_system_failure());
        assert!(state.error.unwrap().context.contains("malformed"));
    }

    #[test]
    fn terminal_job_takes_the_blob_state_over_job_status() {
        // The job manager only knows the process exited; the blob knows why.
        let written = ExecutionState::user_failure("ValueError", "check inputs");
        let state = derive_state(&JobObservation::Status(JobStatus::Succeeded), &blob(&written));
        assert_eq!(state.failure_type, Some(FailureType::User));
    }

    #[test]
    fn live_job_is_running_regardless_of_blob() {
        for status in [JobStatus::Pending, JobStatus::Running] {
            let obs = JobObservation::Status(status);
            assert!(!obs.needs_metadata());
            let state = derive_state(&obs, &blob(&ExecutionState::new(ExecutionStatus::Succeeded)));
            assert_eq!(state.status, ExecutionStatus::Running);
        }
    }

    #[test]
    fn poll_errors_degrade_to_system_failure() {
        let state = derive_state(
            &JobObservation::PollFailed("connection reset".into()),
            &MetadataBlob::Absent,
        );
        assert!(state.is_system_failure());
        assert!(state.error.unwrap().context.contains("connection reset"));
    }

    #[test]
    fn minimal_blob_parses_with_defaults() {
        let state = derive_state(
            &JobObservation::NotExist,
            &MetadataBlob::Present(br#"{"status":"succeeded"}"#.to_vec()),
        );
        assert_eq!(state.status, ExecutionStatus::Succeeded);
        assert!(state.terminated());
    }

    #[test]
    fn stamping_keeps_earlier_timestamps() {
        let t0 = Utc::now();
        let pending = ExecutionState::pending().stamped(&ExecutionTimestamps::default(), t0);
        let running = ExecutionState::running().stamped(&pending.timestamps, t0);

        assert_eq!(running.timestamps.pending_at, Some(t0));
        assert_eq!(running.timestamps.running_at, Some(t0));
        assert!(running.timestamps.finished_at.is_none());
    }
}
