//! `MockJobManager`: a test double for `JobManager`.
//!
//! Records every launch and cancel it receives and reports scripted
//! statuses. When given a storage handle it also plays the role of the
//! backend worker: on launch it writes the operator metadata blob and each
//! output's content + metadata, exactly where a real worker would.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use storage::Storage;

use crate::{ArtifactType, JobError, JobManager, JobSpec, JobStatus};

/// Behaviour injected into `MockJobManager`, optionally per job.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Accept the job and report `Running` until told otherwise.
    StayRunning,
    /// Write successful results and report `Succeeded`.
    Succeed,
    /// Write a user failure and report `Failed`.
    FailUser(String),
    /// Report `Succeeded` without writing anything (a worker that died
    /// after signalling completion but before persisting its metadata).
    SucceedWithoutMetadata,
    /// Refuse the launch.
    RejectLaunch(String),
}

/// A mock backend that records every call it receives.
pub struct MockJobManager {
    storage: Option<Arc<dyn Storage>>,
    default_behaviour: MockBehaviour,
    /// `(job-name fragment, behaviour)` overrides, first match wins.
    overrides: Mutex<Vec<(String, MockBehaviour)>>,
    statuses: Mutex<HashMap<String, Result<JobStatus, String>>>,
    launched: Mutex<Vec<JobSpec>>,
    cancelled: Mutex<Vec<String>>,
}

impl MockJobManager {
    /// A backend that accepts jobs and leaves them running.
    pub fn new() -> Self {
        Self::with_behaviour(None, MockBehaviour::StayRunning)
    }

    /// A backend whose jobs succeed and write their results to `storage`.
    pub fn succeeding(storage: Arc<dyn Storage>) -> Self {
        Self::with_behaviour(Some(storage), MockBehaviour::Succeed)
    }

    pub fn with_behaviour(storage: Option<Arc<dyn Storage>>, behaviour: MockBehaviour) -> Self {
        Self {
            storage,
            default_behaviour: behaviour,
            overrides: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    /// Use `behaviour` for every job whose name contains `fragment`.
    pub fn behave_for(&self, fragment: impl Into<String>, behaviour: MockBehaviour) {
        self.overrides.lock().push((fragment.into(), behaviour));
    }

    /// Force the status reported for `name`.
    pub fn set_status(&self, name: impl Into<String>, status: JobStatus) {
        self.statuses.lock().insert(name.into(), Ok(status));
    }

    /// Make polling `name` fail with a backend error.
    pub fn fail_poll(&self, name: impl Into<String>, message: impl Into<String>) {
        self.statuses.lock().insert(name.into(), Err(message.into()));
    }

    /// Forget `name`, as a garbage-collecting backend would.
    pub fn forget(&self, name: &str) {
        self.statuses.lock().remove(name);
    }

    /// Number of launches received (duplicates included).
    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }

    /// Every spec received by `launch`, in call order.
    pub fn launched(&self) -> Vec<JobSpec> {
        self.launched.lock().clone()
    }

    /// Names passed to `cancel`, in call order.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    fn behaviour_for(&self, name: &str) -> MockBehaviour {
        self.overrides
            .lock()
            .iter()
            .find(|(fragment, _)| name.contains(fragment.as_str()))
            .map(|(_, b)| b.clone())
            .unwrap_or_else(|| self.default_behaviour.clone())
    }

    async fn write_results(&self, spec: &JobSpec, exec_state: serde_json::Value) -> Result<(), JobError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let io = |e: storage::StorageError| JobError::Launch {
            job: spec.job_name.clone(),
            message: e.to_string(),
        };

        let outputs = spec
            .output_content_paths
            .iter()
            .zip(&spec.output_metadata_paths)
            .zip(&spec.output_artifact_types);
        for ((content_path, metadata_path), declared) in outputs {
            let observed = match declared {
                ArtifactType::Untyped => ArtifactType::String,
                other => *other,
            };
            let metadata = json!({
                "schema": [],
                "system_metadata": {},
                "artifact_type": observed,
                "serialization_type": "string",
            });
            storage.put(content_path, spec.job_name.as_bytes()).await.map_err(io)?;
            storage
                .put(metadata_path, metadata.to_string().as_bytes())
                .await
                .map_err(io)?;
        }

        storage
            .put(&spec.metadata_path, exec_state.to_string().as_bytes())
            .await
            .map_err(io)
    }
}

impl Default for MockJobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobManager for MockJobManager {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, name: &str, spec: &JobSpec) -> Result<(), JobError> {
        self.launched.lock().push(spec.clone());
        if self.statuses.lock().contains_key(name) {
            return Ok(());
        }

        let status = match self.behaviour_for(name) {
            MockBehaviour::StayRunning => JobStatus::Running,
            MockBehaviour::Succeed => {
                self.write_results(spec, json!({"status": "succeeded"})).await?;
                JobStatus::Succeeded
            }
            MockBehaviour::FailUser(message) => {
                let state = json!({
                    "status": "failed",
                    "failure_type": "user",
                    "error": {"context": message, "tip": "Check the operator's logs."},
                });
                self.write_results(spec, state).await?;
                JobStatus::Failed
            }
            MockBehaviour::SucceedWithoutMetadata => JobStatus::Succeeded,
            MockBehaviour::RejectLaunch(message) => {
                return Err(JobError::Launch { job: name.to_owned(), message });
            }
        };

        self.statuses.lock().insert(name.to_owned(), Ok(status));
        Ok(())
    }

    async fn poll(&self, name: &str) -> Result<JobStatus, JobError> {
        match self.statuses.lock().get(name) {
            None => Err(JobError::NotExist(name.to_owned())),
            Some(Ok(status)) => Ok(*status),
            Some(Err(message)) => Err(JobError::Poll {
                job: name.to_owned(),
                message: message.clone(),
            }),
        }
    }

    async fn cancel(&self, name: &str) -> Result<(), JobError> {
        self.cancelled.lock().push(name.to_owned());
        Ok(())
    }
}
