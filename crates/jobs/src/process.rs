//! Local backend that runs each job as a child process.
//!
//! The configured executor program receives the JSON job spec as
//! `--spec <json>` and is expected to write the operator metadata blob (and
//! its outputs) to storage before exiting.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{JobError, JobManager, JobSpec, JobStatus};

/// [`JobManager`] that spawns one local process per job.
///
/// A job is forgotten once a poll has reported its exit or it has been
/// canceled; later polls report [`JobError::NotExist`] and callers fall back
/// to the metadata blob the job wrote.
pub struct ProcessJobManager {
    program: String,
    args: Vec<String>,
    jobs: Mutex<HashMap<String, Child>>,
}

impl ProcessJobManager {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of jobs still tracked.
    pub fn tracked(&self) -> usize {
        self.jobs.lock().len()
    }
}

#[async_trait]
impl JobManager for ProcessJobManager {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, name: &str, spec: &JobSpec) -> Result<(), JobError> {
        let payload = serde_json::to_string(spec)?;

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(name) {
            debug!(job = name, "job already launched, ignoring duplicate launch");
            return Ok(());
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("--spec")
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::Launch {
                job: name.to_owned(),
                message: format!("cannot spawn '{}': {e}", self.program),
            })?;

        info!(job = name, pid = child.id(), job_type = spec.job_type(), "launched process job");
        jobs.insert(name.to_owned(), child);
        Ok(())
    }

    async fn poll(&self, name: &str) -> Result<JobStatus, JobError> {
        let mut jobs = self.jobs.lock();
        let child = jobs
            .get_mut(name)
            .ok_or_else(|| JobError::NotExist(name.to_owned()))?;

        let status = match child.try_wait() {
            Ok(Some(exit)) if exit.success() => JobStatus::Succeeded,
            Ok(Some(exit)) => {
                debug!(job = name, code = exit.code(), "process job exited non-zero");
                JobStatus::Failed
            }
            Ok(None) => return Ok(JobStatus::Running),
            Err(e) => {
                return Err(JobError::Poll {
                    job: name.to_owned(),
                    message: e.to_string(),
                })
            }
        };

        jobs.remove(name);
        Ok(status)
    }

    async fn cancel(&self, name: &str) -> Result<(), JobError> {
        let mut child = self
            .jobs
            .lock()
            .remove(name)
            .ok_or_else(|| JobError::NotExist(name.to_owned()))?;

        // Signal explicitly so a failed kill is reported.
        if let Err(e) = child.start_kill() {
            warn!(job = name, error = %e, "failed to signal process job");
            return Err(JobError::Cancel {
                job: name.to_owned(),
                message: e.to_string(),
            });
        }
        Ok(())
    }
}
