//! Operator lifecycle within one run.
//!
//! An [`Operator`] owns its output [`Artifact`]s and the job spec built at
//! construction. Its observable state comes from [`derive_state`] over the
//! job manager and the operator metadata blob, so an operator whose backend
//! job has been garbage-collected is still recovered from storage.
//!
//! Every method that changes the operator takes `&mut self`: one task
//! drives one operator.

mod job_spec;

pub use job_spec::{DEFAULT_ENTRY_POINT_CLASS, DEFAULT_ENTRY_POINT_FILE, DEFAULT_ENTRY_POINT_METHOD};

use chrono::Utc;
use db::{models::ExecutionStatus, repository::results};
use jobs::{JobError, JobSpec, OperatorType};
use jobs::spec::{CheckSeverity, JobDetails};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    advisory::advise,
    artifact::Artifact,
    env::{ExecutionEnv, ExecutionMode},
    error::EngineError,
    exec_state::{derive_state, ExecutionState, FailureType, JobObservation, MetadataBlob},
    models::{OperatorDef, OperatorKind},
    paths::{job_name, operator_function_path, operator_metadata_path},
    preview_cache::PreviewCacheManager,
};

pub struct Operator {
    def: OperatorDef,
    job_name: String,
    metadata_path: String,
    job_spec: JobSpec,
    outputs: Vec<Artifact>,
    env: ExecutionEnv,
    exec_state: ExecutionState,
    result_id: Option<Uuid>,
    results_persisted: bool,
    /// Set once a job has been dispatched for this operator.
    dispatched: bool,
    staged_function: Option<StagedFunction>,
}

/// A serialized function copied into the run's own paths.
#[derive(Debug, Clone)]
struct StagedFunction {
    source: String,
    path: String,
}

impl Operator {
    /// Build the run handle for `def` in run `run_id`.
    ///
    /// `inputs` are the upstream artifacts in input order; `outputs` are
    /// this operator's own artifacts in output order.
    pub fn new(
        def: &OperatorDef,
        inputs: &[&Artifact],
        outputs: Vec<Artifact>,
        run_id: Uuid,
        env: ExecutionEnv,
    ) -> Result<Self, EngineError> {
        if env.preview_cache.is_some() && env.results.is_some() {
            return Err(EngineError::precondition(format!(
                "operator {}: a cache-aware operator cannot persist results",
                def.id
            )));
        }

        let job_name = job_name(run_id, def.id);
        let metadata_path = operator_metadata_path(run_id, def.id);
        if let Some(out) = outputs.iter().find(|a| a.paths().op_metadata_path != metadata_path) {
            return Err(EngineError::InvalidOperator {
                operator: def.name.clone(),
                message: format!("output {} points at another operator's metadata", out.id()),
            });
        }

        let mut job_spec = job_spec::build(&job_spec::SpecInputs {
            def,
            inputs,
            outputs: &outputs,
            job_name: &job_name,
            metadata_path: &metadata_path,
            storage_config: &env.storage_config,
        })?;

        // Previews run the job against a copy that finish() may remove.
        let staged_function = match (&mut job_spec.details, env.mode()) {
            (JobDetails::Function { function_path, .. }, ExecutionMode::Preview) => {
                let path = operator_function_path(run_id, def.id);
                let source = std::mem::replace(function_path, path.clone());
                Some(StagedFunction { source, path })
            }
            _ => None,
        };

        Ok(Self {
            def: def.clone(),
            job_name,
            metadata_path,
            job_spec,
            outputs,
            env,
            exec_state: ExecutionState::pending().stamped(&Default::default(), Utc::now()),
            result_id: None,
            results_persisted: false,
            dispatched: false,
            staged_function,
        })
    }

    pub fn id(&self) -> Uuid {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn operator_type(&self) -> OperatorType {
        self.def.spec.kind.operator_type()
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn job_spec(&self) -> &JobSpec {
        &self.job_spec
    }

    pub fn metadata_path(&self) -> &str {
        &self.metadata_path
    }

    pub fn outputs(&self) -> &[Artifact] {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut [Artifact] {
        &mut self.outputs
    }

    pub fn results_persisted(&self) -> bool {
        self.results_persisted
    }

    /// The state observed at the last `launch`, `poll` or `cancel`.
    pub fn exec_state(&self) -> &ExecutionState {
        &self.exec_state
    }

    /// A failed warning-level check does not fail the run.
    pub fn is_warning_check(&self) -> bool {
        matches!(&self.def.spec.kind, OperatorKind::Check(c) if c.level == CheckSeverity::Warning)
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Start the operator: serve every output from the preview cache if
    /// possible, dispatch the job otherwise.
    #[instrument(skip(self), fields(operator = %self.def.id, job = %self.job_name))]
    pub async fn launch(&mut self) -> Result<(), EngineError> {
        if self.exec_state.status != ExecutionStatus::Pending {
            return Err(EngineError::precondition(format!(
                "operator {}: cannot launch from status {}",
                self.def.id, self.exec_state.status
            )));
        }

        let served_from_cache = match self.env.preview_cache.clone() {
            Some(cache) => self.launch_from_cache(cache.as_ref()).await,
            None => false,
        };

        if served_from_cache {
            info!("all outputs served from the preview cache");
        } else {
            self.stage_function().await?;
            self.env.job_manager.launch(&self.job_name, &self.job_spec).await?;
            self.dispatched = true;
            debug!(backend = self.env.job_manager.kind(), "job dispatched");
        }

        self.set_state(ExecutionState::running());
        Ok(())
    }

    /// Copy cached blobs into this run's paths. Returns false (after
    /// removing anything already copied) unless every output was served.
    async fn launch_from_cache(&self, cache: &dyn PreviewCacheManager) -> bool {
        let signatures: Option<Vec<Uuid>> = self.outputs.iter().map(Artifact::signature).collect();
        let signatures = match signatures {
            Some(sigs) if !sigs.is_empty() => sigs,
            _ => return false,
        };

        let lookup = match cache.get_multi(&signatures).await {
            Ok(lookup) if lookup.all_hit => lookup,
            Ok(_) => return false,
            Err(err) => {
                error!(error = %err, "unable to query preview cache");
                return false;
            }
        };

        let storage = &self.env.storage;
        let mut copied: Vec<String> = Vec::new();
        for (output, signature) in self.outputs.iter().zip(&signatures) {
            let Some(entry) = lookup.entries.get(signature) else {
                self.discard(&copied).await;
                return false;
            };
            let dst = output.paths();
            let copies = [
                (&entry.paths.artifact_content_path, &dst.artifact_content_path),
                (&entry.paths.artifact_metadata_path, &dst.artifact_metadata_path),
                (&entry.paths.op_metadata_path, &dst.op_metadata_path),
            ];
            for (src, dst) in copies {
                if src == dst {
                    continue;
                }
                if let Err(err) = storage.copy(src, dst).await {
                    warn!(error = %err, %src, %dst, "preview cache copy failed, dispatching instead");
                    self.discard(&copied).await;
                    return false;
                }
                copied.push(dst.clone());
            }
        }
        true
    }

    /// Copy the registered function blob to the run-owned path the job spec
    /// points at. A missing source is left for the job to report.
    async fn stage_function(&self) -> Result<(), EngineError> {
        let Some(staged) = &self.staged_function else {
            return Ok(());
        };
        let storage = &self.env.storage;
        if storage.exists(&staged.source).await? {
            storage.copy(&staged.source, &staged.path).await?;
        } else {
            warn!(source = %staged.source, "serialized function is missing, job will not find it");
        }
        Ok(())
    }

    async fn discard(&self, paths: &[String]) {
        for path in paths {
            advise("cached blob cleanup", self.env.storage.delete(path).await);
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    /// Derive the current state from the job manager and the metadata blob.
    /// Never fails: anything unexpected is reported as `Failed/System`.
    pub async fn get_exec_state(&self) -> ExecutionState {
        let job = match self.env.job_manager.poll(&self.job_name).await {
            Ok(status) => JobObservation::Status(status),
            Err(JobError::NotExist(_)) => JobObservation::NotExist,
            Err(err) => JobObservation::PollFailed(err.to_string()),
        };

        let blob = if job.needs_metadata() {
            self.read_metadata_blob().await
        } else {
            MetadataBlob::Absent
        };

        let state = match (&job, &blob) {
            // A dispatched job that vanished without writing metadata crashed.
            (JobObservation::NotExist, MetadataBlob::Absent) if self.dispatched => {
                ExecutionState::system_failure("job disappeared before writing operator metadata")
            }
            _ => derive_state(&job, &blob),
        };
        if state.is_system_failure() {
            error!(
                operator = %self.def.id,
                job = %self.job_name,
                observation = ?job,
                context = state.error.as_ref().map(|e| e.context.as_str()).unwrap_or_default(),
                "operator failed with a system error"
            );
        }
        state
    }

    async fn read_metadata_blob(&self) -> MetadataBlob {
        match self.env.storage.exists(&self.metadata_path).await {
            Ok(false) => MetadataBlob::Absent,
            Ok(true) => match self.env.storage.get(&self.metadata_path).await {
                Ok(bytes) => MetadataBlob::Present(bytes),
                Err(err) => MetadataBlob::Unreadable(err.to_string()),
            },
            Err(err) => MetadataBlob::Unreadable(err.to_string()),
        }
    }

    /// Refresh and return the in-memory state. A canceled operator stays
    /// canceled.
    pub async fn poll(&mut self) -> &ExecutionState {
        if self.exec_state.status != ExecutionStatus::Canceled {
            let state = self.get_exec_state().await;
            self.set_state(state);
        }
        &self.exec_state
    }

    /// Mark the operator canceled and ask the backend to stop its job.
    pub async fn cancel(&mut self, context: &str, tip: &str) {
        if self.exec_state.terminated() {
            return;
        }
        let was_launched = self.exec_state.status != ExecutionStatus::Pending;
        self.set_state(ExecutionState::canceled(context, tip));
        if was_launched {
            match self.env.job_manager.cancel(&self.job_name).await {
                Err(JobError::NotExist(_)) => {}
                other => {
                    advise("job cancel", other);
                }
            }
        }
    }

    fn set_state(&mut self, state: ExecutionState) {
        let previous = std::mem::take(&mut self.exec_state.timestamps);
        self.exec_state = state.stamped(&previous, Utc::now());
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Create the operator's result row (Pending) under `dag_result_id`.
    pub async fn initialize_result(&mut self, dag_result_id: Uuid) -> Result<(), EngineError> {
        let pool = self.env.results.as_ref().ok_or_else(|| {
            EngineError::precondition(format!("operator {}: result writer is missing", self.def.id))
        })?;

        let row = results::create_operator_result(
            pool,
            dag_result_id,
            self.def.id,
            ExecutionStatus::Pending,
            Some(serde_json::to_value(&self.exec_state)?),
        )
        .await?;

        self.result_id = Some(row.id);
        Ok(())
    }

    /// Write the terminal state to the operator's result row, then to every
    /// output artifact. Allowed once, in publish mode only.
    ///
    /// The operator row is the primary write; artifact writes are advisory.
    #[instrument(skip(self), fields(operator = %self.def.id))]
    pub async fn persist_result(&mut self) -> Result<(), EngineError> {
        if self.env.mode() == ExecutionMode::Preview {
            return Err(EngineError::precondition(format!(
                "operator {}: results are not persisted while previewing",
                self.def.id
            )));
        }
        if self.env.preview_cache.is_some() {
            return Err(EngineError::precondition(format!(
                "operator {}: a cache-aware operator cannot persist results",
                self.def.id
            )));
        }
        if self.results_persisted {
            return Err(EngineError::precondition(format!(
                "operator {}: results have already been persisted",
                self.def.id
            )));
        }
        let (Some(pool), Some(result_id)) = (self.env.results.clone(), self.result_id) else {
            return Err(EngineError::precondition(format!(
                "operator {}: initialize_result must be called before persist_result",
                self.def.id
            )));
        };

        let state = if self.exec_state.status == ExecutionStatus::Canceled {
            self.exec_state.clone()
        } else {
            let fresh = self.get_exec_state().await;
            self.set_state(fresh);
            self.exec_state.clone()
        };
        if !state.terminated() {
            return Err(EngineError::precondition(format!(
                "operator {}: cannot persist a {} state",
                self.def.id, state.status
            )));
        }

        results::update_operator_result(&pool, result_id, state.status, serde_json::to_value(&state)?)
            .await?;
        self.results_persisted = true;

        for output in &mut self.outputs {
            let what = format!("artifact {} result", output.id());
            advise(&what, output.persist_result(&state).await);
        }

        if state.failure_type == Some(FailureType::User) {
            info!(status = %state.status, "operator failed with a user error");
        } else {
            info!(status = %state.status, "operator results persisted");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finish
    // -----------------------------------------------------------------------

    /// Release the operator and its outputs, cleaning up run-scoped blobs.
    pub async fn finish(self) {
        let storage = &self.env.storage;

        // Until persisted, the metadata blob is the only record of the result.
        if self.results_persisted {
            advise("operator metadata cleanup", storage.delete(&self.metadata_path).await);
        }

        if let Some(staged) = &self.staged_function {
            advise("staged function cleanup", storage.delete(&staged.path).await);
        }

        for output in self.outputs {
            output.finish().await;
        }
    }
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.def.id)
            .field("name", &self.def.name)
            .field("job_name", &self.job_name)
            .field("status", &self.exec_state.status)
            .field("outputs", &self.outputs)
            .finish()
    }
}
