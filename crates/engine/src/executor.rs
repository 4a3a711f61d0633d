//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the DAG-level orchestrator:
//! 1. Validates the DAG and produces a topological ordering.
//! 2. Builds one [`Operator`] (owning its output [`Artifact`]s) per node.
//! 3. In publish mode, creates the DAG result and every result row.
//! 4. Launches ready operators in bounded groups and polls them until
//!    terminal, persisting each one as it completes.
//! 5. Cancels operators downstream of a failure, or everything when the
//!    run's `CancellationToken` fires.
//! 6. Records the aggregate status, finishes every node and applies the
//!    workflow's retention policy.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use db::{models::ExecutionStatus, repository::results};
use jobs::batch::run_in_groups;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    advisory::advise,
    artifact::Artifact,
    dag::{compute_signatures, validate_dag, DagPlan},
    env::{ExecutionEnv, ExecutionMode},
    error::EngineError,
    exec_state::{ExecutionState, FailureType, TIP_CANCELED, TIP_UPSTREAM_FAILED},
    models::{Workflow, WorkflowDag},
    operator::Operator,
    paths::ExecPaths,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Delay between two polling rounds.
    pub poll_interval: Duration,
    /// Maximum number of launches in flight at once.
    pub launch_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            launch_concurrency: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Output of a completed execution
// ---------------------------------------------------------------------------

/// The result of running a full DAG.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Scopes every storage path written by this run.
    pub run_id: Uuid,
    /// The `dag_results` row, in publish mode.
    pub dag_result_id: Option<Uuid>,
    pub status: ExecutionStatus,
    /// Final state of every operator.
    pub operator_states: HashMap<Uuid, ExecutionState>,
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Stateless orchestrator that runs DAGs in one execution env.
pub struct WorkflowExecutor {
    env: ExecutionEnv,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor.
    pub fn new(env: ExecutionEnv, config: ExecutorConfig) -> Self {
        Self { env, config }
    }

    /// Run `dag` (a version of `workflow`) to completion.
    ///
    /// # Errors
    /// Returns `EngineError` for validation failures, construction errors,
    /// rejected launches, or database problems with the DAG result itself.
    /// Operator failures are not errors: they show up in the returned status.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, dag_id = %dag.id))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        dag: &WorkflowDag,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        // ------------------------------------------------------------------
        // Validate and build the run.
        // ------------------------------------------------------------------
        let plan = validate_dag(dag)?;
        info!(
            operators = plan.order.len(),
            mode = ?self.env.mode(),
            "DAG validated"
        );

        let signatures = if self.env.preview_cache.is_some() {
            compute_signatures(dag, &plan)?
        } else {
            HashMap::new()
        };

        let run_id = Uuid::new_v4();
        let mut operators = self.build_operators(dag, &plan, &signatures, run_id)?;

        // ------------------------------------------------------------------
        // Create the DAG result and every result row.
        // ------------------------------------------------------------------
        let started = ExecutionState::running().stamped(&Default::default(), Utc::now());
        let dag_result_id = match &self.env.results {
            Some(pool) => {
                let row = results::create_dag_result(
                    pool,
                    workflow.id,
                    dag.id,
                    ExecutionStatus::Running,
                    Some(serde_json::to_value(&started)?),
                    Utc::now(),
                )
                .await?;
                Some(row.id)
            }
            None => None,
        };

        if let Some(id) = dag_result_id {
            if let Err(err) = initialize_results(&mut operators, id).await {
                self.abort(operators, id, &started, &err).await;
                return Err(err);
            }
        }

        // ------------------------------------------------------------------
        // Drive operators to completion.
        // ------------------------------------------------------------------
        let status = match self.drive(&mut operators, &plan, &cancel).await {
            Ok(status) => status,
            Err(err) => {
                error!(error = %err, "run aborted");
                match dag_result_id {
                    Some(id) => self.abort(operators, id, &started, &err).await,
                    None => cancel_and_finish(operators, "run aborted").await,
                }
                return Err(err);
            }
        };

        let operator_states: HashMap<Uuid, ExecutionState> = operators
            .iter()
            .map(|op| (op.id(), op.exec_state().clone()))
            .collect();

        // ------------------------------------------------------------------
        // Record the outcome.
        // ------------------------------------------------------------------
        if let (Some(id), Some(pool)) = (dag_result_id, &self.env.results) {
            let finished = ExecutionState::new(status).stamped(&started.timestamps, Utc::now());
            results::update_dag_result(pool, id, status, serde_json::to_value(&finished)?).await?;

            let keep = workflow.retention_policy.k_latest_runs;
            if keep > 0 {
                if let Some(deleted) = advise(
                    "retention policy",
                    results::delete_excess_dag_results(pool, workflow.id, keep).await,
                ) {
                    if deleted > 0 {
                        info!(deleted, keep, "pruned old DAG results");
                    }
                }
            }
        }

        for op in operators {
            op.finish().await;
        }

        info!(%run_id, %status, "run finished");
        Ok(ExecutionResult { run_id, dag_result_id, status, operator_states })
    }

    // -----------------------------------------------------------------------
    // Internal: construction
    // -----------------------------------------------------------------------

    fn build_operators(
        &self,
        dag: &WorkflowDag,
        plan: &DagPlan,
        signatures: &HashMap<Uuid, Uuid>,
        run_id: Uuid,
    ) -> Result<Vec<Operator>, EngineError> {
        let mut operators: Vec<Operator> = Vec::with_capacity(plan.order.len());

        for &op_id in &plan.order {
            let def = dag
                .operator(op_id)
                .ok_or(EngineError::UnknownNodeReference { node_id: op_id, side: "operator" })?;

            let outputs = plan
                .outputs_of(op_id)
                .iter()
                .map(|&artifact_id| {
                    let artifact = dag.artifact(artifact_id).ok_or(EngineError::UnknownNodeReference {
                        node_id: artifact_id,
                        side: "artifact",
                    })?;
                    Artifact::new(
                        artifact,
                        signatures.get(&artifact_id).copied(),
                        ExecPaths::for_run(run_id, artifact_id, op_id),
                        &self.env,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;

            // Topological order guarantees producers are already built.
            let inputs = plan
                .inputs_of(op_id)
                .iter()
                .map(|&artifact_id| {
                    operators
                        .iter()
                        .flat_map(Operator::outputs)
                        .find(|a| a.id() == artifact_id)
                        .ok_or(EngineError::UnknownNodeReference { node_id: artifact_id, side: "input" })
                })
                .collect::<Result<Vec<&Artifact>, _>>()?;

            let op = Operator::new(def, &inputs, outputs, run_id, self.env.clone())?;
            operators.push(op);
        }

        Ok(operators)
    }

    // -----------------------------------------------------------------------
    // Internal: the polling loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        operators: &mut [Operator],
        plan: &DagPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionStatus, EngineError> {
        let publish = self.env.mode() == ExecutionMode::Publish;
        let mut persisted: HashSet<Uuid> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancel_remaining(operators, &mut persisted).await);
            }

            // --------------------------------------------------------------
            // Block operators downstream of failures; collect ready ones.
            // --------------------------------------------------------------
            let outcome: HashMap<Uuid, Upstream> =
                operators.iter().map(|op| (op.id(), Upstream::of(op))).collect();

            let mut ready: HashSet<Uuid> = HashSet::new();
            let mut blocked: HashSet<Uuid> = HashSet::new();
            for op in operators.iter() {
                if op.exec_state().status != ExecutionStatus::Pending {
                    continue;
                }
                let upstream = plan.upstream_of(op.id());
                if upstream.iter().any(|u| outcome.get(u) == Some(&Upstream::Blocking)) {
                    blocked.insert(op.id());
                } else if upstream.iter().all(|u| outcome.get(u) == Some(&Upstream::Satisfied)) {
                    ready.insert(op.id());
                }
            }

            for op in operators.iter_mut().filter(|op| blocked.contains(&op.id())) {
                warn!(operator = %op.id(), "upstream failed, not running operator");
                op.cancel("An upstream operator failed.", TIP_UPSTREAM_FAILED).await;
            }

            if !ready.is_empty() {
                let batch: Vec<&mut Operator> =
                    operators.iter_mut().filter(|op| ready.contains(&op.id())).collect();
                info!(count = batch.len(), "launching operators");
                run_in_groups(batch, self.config.launch_concurrency, |op| op.launch()).await?;
            }

            // --------------------------------------------------------------
            // Poll running operators and persist terminal ones.
            // --------------------------------------------------------------
            for op in operators.iter_mut() {
                if op.exec_state().status == ExecutionStatus::Running {
                    let id = op.id();
                    let state = op.poll().await;
                    if state.terminated() {
                        info!(operator = %id, status = %state.status, "operator finished");
                    }
                }
            }

            if publish {
                persist_terminal(operators, &mut persisted).await;
            }

            if operators.iter().all(|op| op.exec_state().terminated()) {
                return Ok(aggregate_status(operators));
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn cancel_remaining(
        &self,
        operators: &mut [Operator],
        persisted: &mut HashSet<Uuid>,
    ) -> ExecutionStatus {
        info!("run canceled");
        for op in operators.iter_mut() {
            op.cancel("The run was canceled.", TIP_CANCELED).await;
        }
        if self.env.mode() == ExecutionMode::Publish {
            persist_terminal(operators, persisted).await;
        }
        ExecutionStatus::Canceled
    }

    /// Mark the DAG result failed, cancel and finish everything. Every step
    /// is best-effort: the original error is what the caller sees.
    async fn abort(
        &self,
        mut operators: Vec<Operator>,
        dag_result_id: Uuid,
        started: &ExecutionState,
        cause: &EngineError,
    ) {
        if let Some(pool) = &self.env.results {
            let failed = ExecutionState::system_failure(cause.to_string())
                .stamped(&started.timestamps, Utc::now());
            if let Ok(value) = serde_json::to_value(&failed) {
                advise(
                    "mark DAG result failed",
                    results::update_dag_result(pool, dag_result_id, ExecutionStatus::Failed, value).await,
                );
            }
        }
        let mut persisted = HashSet::new();
        for op in operators.iter_mut() {
            op.cancel("The run was aborted.", TIP_CANCELED).await;
        }
        persist_terminal(&mut operators, &mut persisted).await;
        for op in operators {
            op.finish().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// How an operator's state affects its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upstream {
    Satisfied,
    Waiting,
    Blocking,
}

impl Upstream {
    fn of(op: &Operator) -> Self {
        let state = op.exec_state();
        match state.status {
            ExecutionStatus::Succeeded => Self::Satisfied,
            ExecutionStatus::Failed if is_tolerated_failure(op) => Self::Satisfied,
            ExecutionStatus::Failed | ExecutionStatus::Canceled => Self::Blocking,
            _ => Self::Waiting,
        }
    }
}

/// A warning-level check that failed on the user's data.
fn is_tolerated_failure(op: &Operator) -> bool {
    op.is_warning_check() && op.exec_state().failure_type == Some(FailureType::User)
}

/// Failed if any operator failed (tolerated checks aside), Canceled if any
/// operator was canceled without an upstream failure, Succeeded otherwise.
fn aggregate_status(operators: &[Operator]) -> ExecutionStatus {
    let failed = operators
        .iter()
        .any(|op| op.exec_state().status == ExecutionStatus::Failed && !is_tolerated_failure(op));
    if failed {
        return ExecutionStatus::Failed;
    }
    if operators.iter().any(|op| op.exec_state().status == ExecutionStatus::Canceled) {
        return ExecutionStatus::Canceled;
    }
    ExecutionStatus::Succeeded
}

async fn initialize_results(operators: &mut [Operator], dag_result_id: Uuid) -> Result<(), EngineError> {
    for op in operators.iter_mut() {
        op.initialize_result(dag_result_id).await?;
        for output in op.outputs_mut() {
            output.initialize_result(dag_result_id).await?;
        }
    }
    Ok(())
}

/// Persist every terminal operator not attempted yet. A failed attempt is
/// logged and not retried.
async fn persist_terminal(operators: &mut [Operator], persisted: &mut HashSet<Uuid>) {
    for op in operators.iter_mut() {
        if !op.exec_state().terminated() || !persisted.insert(op.id()) {
            continue;
        }
        if let Err(err) = op.persist_result().await {
            error!(operator = %op.id(), error = %err, "unable to persist operator result");
        }
    }
}

async fn cancel_and_finish(mut operators: Vec<Operator>, reason: &str) {
    for op in operators.iter_mut() {
        op.cancel(reason, TIP_CANCELED).await;
    }
    for op in operators {
        op.finish().await;
    }
}
