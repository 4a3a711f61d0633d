//! Import of runs executed by an external scheduler.
//!
//! DAGs bound to Airflow are not run by the [`WorkflowExecutor`]; Airflow
//! runs them and the [`Reconciler`] copies finished runs back into the
//! result tables, so they read exactly like local runs.
//!
//! Runs are de-duplicated by start time: a remote run whose start date equals
//! the `created_at` of an existing DAG result of the same workflow is treated
//! as already imported. Two distinct remote runs starting at the same instant
//! would therefore collapse into one; Airflow reports start dates with
//! sub-second precision, so this is accepted as a known limitation.
//!
//! [`WorkflowExecutor`]: crate::WorkflowExecutor

pub mod airflow;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{
    models::ExecutionStatus,
    repository::{dags, results},
    DbPool,
};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::EngineError,
    exec_state::ExecutionState,
    models::{AirflowConfig, EngineConfig, WorkflowDag},
    paths::ExecPaths,
};

pub use airflow::{AirflowClient, AirflowConnector, AirflowCredentials};

// ---------------------------------------------------------------------------
// Remote model
// ---------------------------------------------------------------------------

/// A DAG as registered with the remote scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDag {
    pub dag_id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteRunState {
    Queued,
    Running,
    Success,
    Failed,
    #[serde(other)]
    Other,
}

impl RemoteRunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// One run of a remote DAG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteDagRun {
    pub dag_run_id: String,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub state: RemoteRunState,
}

/// Airflow task instance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Success,
    Failed,
    UpstreamFailed,
    Skipped,
    Removed,
    Shutdown,
    Running,
    Queued,
    Scheduled,
    UpForRetry,
    UpForReschedule,
    Deferred,
    Restarting,
    /// Not scheduled yet, or a state this client does not know.
    #[serde(other)]
    None,
}

/// Translate a remote task state into the operator state recorded locally.
pub fn map_task_state(state: TaskState) -> ExecutionState {
    match state {
        TaskState::Success => ExecutionState::new(ExecutionStatus::Succeeded),
        TaskState::Failed => ExecutionState::user_failure(
            "The Airflow task failed.",
            "Check the task's logs in Airflow for details.",
        ),
        TaskState::UpstreamFailed
        | TaskState::Skipped
        | TaskState::Removed
        | TaskState::Shutdown => {
            ExecutionState::canceled(format!("The Airflow task ended as {state:?}."), "")
        }
        TaskState::Running
        | TaskState::Queued
        | TaskState::Scheduled
        | TaskState::UpForRetry
        | TaskState::UpForReschedule
        | TaskState::Deferred
        | TaskState::Restarting => ExecutionState::running(),
        TaskState::None => ExecutionState::pending(),
    }
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Read access to a remote scheduler.
#[async_trait]
pub trait ExternalScheduler: Send + Sync {
    async fn get_dag(&self, dag_id: &str) -> Result<RemoteDag, EngineError>;

    /// Every run of `dag_id`, in the scheduler's order.
    async fn get_dag_runs(&self, dag_id: &str) -> Result<Vec<RemoteDagRun>, EngineError>;

    /// Task id -> state for one run.
    async fn get_task_states(
        &self,
        dag_id: &str,
        dag_run_id: &str,
    ) -> Result<HashMap<String, TaskState>, EngineError>;
}

/// Resolves an integration to an authenticated scheduler client.
#[async_trait]
pub trait SchedulerConnector: Send + Sync {
    async fn connect(&self, integration_id: Uuid) -> Result<Arc<dyn ExternalScheduler>, EngineError>;
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Outcome of one sync pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub imported_runs: usize,
    /// DAGs whose sync failed; each was logged.
    pub failed_dags: Vec<Uuid>,
}

pub struct Reconciler {
    pool: DbPool,
    connector: Arc<dyn SchedulerConnector>,
}

impl Reconciler {
    pub fn new(pool: DbPool, connector: Arc<dyn SchedulerConnector>) -> Self {
        Self { pool, connector }
    }

    /// Sync every DAG bound to Airflow.
    pub async fn sync_all(&self) -> Result<SyncReport, EngineError> {
        let ids = dags::list_dag_ids_by_engine(&self.pool, EngineConfig::AIRFLOW).await?;
        Ok(self.sync_dags(&ids).await)
    }

    /// Sync each of `dag_ids`. A failing DAG is logged and does not stop
    /// the others.
    pub async fn sync_dags(&self, dag_ids: &[Uuid]) -> SyncReport {
        let mut report = SyncReport::default();
        for &dag_id in dag_ids {
            match self.sync_dag(dag_id).await {
                Ok(imported) => report.imported_runs += imported,
                Err(err) => {
                    error!(%dag_id, error = %err, "unable to sync with Airflow");
                    report.failed_dags.push(dag_id);
                }
            }
        }
        info!(imported = report.imported_runs, failed = report.failed_dags.len(), "sync finished");
        report
    }

    #[instrument(skip(self))]
    async fn sync_dag(&self, dag_id: Uuid) -> Result<usize, EngineError> {
        let dag = WorkflowDag::from_rows(dags::get_dag(&self.pool, dag_id).await?)?;
        let Some(mut cfg) = dag.airflow().cloned() else {
            return Err(EngineError::precondition(format!("DAG {dag_id} is not bound to Airflow")));
        };

        let scheduler = self.connector.connect(cfg.integration_id).await?;
        self.check_match(scheduler.as_ref(), dag_id, &mut cfg).await?;

        let runs = scheduler.get_dag_runs(&cfg.dag_id).await?;
        let mut seen: HashSet<DateTime<Utc>> =
            results::get_dag_results_by_workflow(&self.pool, dag.workflow_id)
                .await?
                .into_iter()
                .map(|r| r.created_at)
                .collect();

        let mut imported = 0;
        for run in &runs {
            let Some(started) = run.start_date else {
                debug!(run = %run.dag_run_id, "run has not started");
                continue;
            };
            if seen.contains(&started) || !run.state.is_terminal() {
                continue;
            }
            self.import_run(scheduler.as_ref(), &dag, &cfg, run, started).await?;
            seen.insert(started);
            imported += 1;
        }

        if imported > 0 {
            info!(imported, remote_runs = runs.len(), "imported Airflow runs");
        }
        Ok(imported)
    }

    /// Check the remote DAG was generated from this DAG version: the local
    /// id is among its tags. A match is cached on the engine config.
    async fn check_match(
        &self,
        scheduler: &dyn ExternalScheduler,
        dag_id: Uuid,
        cfg: &mut AirflowConfig,
    ) -> Result<(), EngineError> {
        if cfg.matches_airflow {
            return Ok(());
        }

        let remote = scheduler.get_dag(&cfg.dag_id).await?;
        let local = dag_id.to_string();
        if !remote.tags.iter().any(|tag| *tag == local) {
            warn!(remote_dag = %cfg.dag_id, "Airflow DAG does not match");
            return Err(EngineError::Scheduler(format!(
                "Airflow DAG '{}' does not match DAG {dag_id}; the generated DAG file may not have been deployed yet",
                cfg.dag_id
            )));
        }

        cfg.matches_airflow = true;
        let engine_config = serde_json::to_value(EngineConfig::Airflow(cfg.clone()))?;
        dags::update_engine_config(&self.pool, dag_id, engine_config).await?;
        Ok(())
    }

    /// Write one finished remote run. All rows land in one transaction,
    /// which rolls back on drop if any step fails.
    async fn import_run(
        &self,
        scheduler: &dyn ExternalScheduler,
        dag: &WorkflowDag,
        cfg: &AirflowConfig,
        run: &RemoteDagRun,
        started: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let task_states = scheduler.get_task_states(&cfg.dag_id, &run.dag_run_id).await?;

        let mut dag_state = match run.state {
            RemoteRunState::Success => ExecutionState::new(ExecutionStatus::Succeeded),
            _ => ExecutionState::user_failure(
                format!("Airflow DAG run '{}' failed.", run.dag_run_id),
                "Check the run's task logs in Airflow for details.",
            ),
        };
        dag_state.timestamps.running_at = Some(started);
        dag_state.timestamps.finished_at = run.end_date;

        let mut tx = self.pool.begin().await?;

        let dag_result = results::create_dag_result(
            &mut *tx,
            dag.workflow_id,
            dag.id,
            dag_state.status,
            Some(serde_json::to_value(&dag_state)?),
            started,
        )
        .await?;

        for op in &dag.operators {
            let task_id = cfg.operator_to_task.get(&op.id).ok_or_else(|| {
                EngineError::Scheduler(format!("no Airflow task is mapped to operator {}", op.id))
            })?;
            let task_state = task_states.get(task_id).ok_or_else(|| {
                EngineError::Scheduler(format!(
                    "Airflow run '{}' has no state for task '{task_id}'",
                    run.dag_run_id
                ))
            })?;

            let state = map_task_state(*task_state);
            let state_value = serde_json::to_value(&state)?;
            results::create_operator_result(
                &mut *tx,
                dag_result.id,
                op.id,
                state.status,
                Some(state_value.clone()),
            )
            .await?;

            for artifact_id in dag.edges.iter().filter(|e| e.from == op.id).map(|e| e.to) {
                let paths = ExecPaths::for_external_run(&run.dag_run_id, artifact_id, op.id);
                results::create_artifact_result(
                    &mut *tx,
                    dag_result.id,
                    artifact_id,
                    &paths.artifact_content_path,
                    state.status,
                    Some(state_value.clone()),
                )
                .await?;
            }
        }

        tx.commit().await?;
        debug!(run = %run.dag_run_id, dag_result = %dag_result.id, "imported run");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::{
        models::OperatorKind,
        test_support::{function_kind, insert_dag, migrated_pool, DagBuilder},
    };

    // -----------------------------------------------------------------------
    // Scripted scheduler
    // -----------------------------------------------------------------------

    struct Scripted {
        tags: Vec<String>,
        runs: Vec<RemoteDagRun>,
        tasks: HashMap<String, TaskState>,
        get_dag_calls: AtomicUsize,
    }

    #[async_trait]
    impl ExternalScheduler for Scripted {
        async fn get_dag(&self, dag_id: &str) -> Result<RemoteDag, EngineError> {
            self.get_dag_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteDag { dag_id: dag_id.to_owned(), tags: self.tags.clone() })
        }

        async fn get_dag_runs(&self, _dag_id: &str) -> Result<Vec<RemoteDagRun>, EngineError> {
            Ok(self.runs.clone())
        }

        async fn get_task_states(
            &self,
            _dag_id: &str,
            _dag_run_id: &str,
        ) -> Result<HashMap<String, TaskState>, EngineError> {
            Ok(self.tasks.clone())
        }
    }

    struct Fixed(Arc<Scripted>);

    #[async_trait]
    impl SchedulerConnector for Fixed {
        async fn connect(&self, _integration_id: Uuid) -> Result<Arc<dyn ExternalScheduler>, EngineError> {
            Ok(self.0.clone() as Arc<dyn ExternalScheduler>)
        }
    }

    fn run(id: &str, second: u32, state: RemoteRunState) -> RemoteDagRun {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap();
        RemoteDagRun {
            dag_run_id: id.into(),
            start_date: Some(start),
            end_date: Some(start + chrono::Duration::seconds(30)),
            state,
        }
    }

    /// `extract -> rows -> {left, right}`: one artifact, two consumers.
    struct Bound {
        dag: WorkflowDag,
        extract: Uuid,
        rows: Uuid,
    }

    fn bound_dag(map_all: bool) -> Bound {
        let mut b = DagBuilder::new();
        let extract = b.op("extract", OperatorKind::Param { value: "select 1".into() });
        let rows = b.produce(extract, "rows");
        let left = b.op("left", function_kind());
        b.consume(rows, left);
        b.produce(left, "left_out");
        let right = b.op("right", function_kind());
        b.consume(rows, right);
        b.produce(right, "right_out");

        let mut operator_to_task = HashMap::from([
            (extract, "extract_task".to_owned()),
            (left, "left_task".to_owned()),
        ]);
        if map_all {
            operator_to_task.insert(right, "right_task".to_owned());
        }

        let mut dag = b.build();
        dag.engine_config = EngineConfig::Airflow(AirflowConfig {
            integration_id: Uuid::new_v4(),
            dag_id: "sales_report".into(),
            operator_to_task,
            matches_airflow: false,
        });
        Bound { dag, extract, rows }
    }

    fn scripted(dag_id: Uuid, runs: Vec<RemoteDagRun>) -> Arc<Scripted> {
        Arc::new(Scripted {
            tags: vec!["team:data".into(), dag_id.to_string()],
            runs,
            tasks: HashMap::from([
                ("extract_task".to_owned(), TaskState::Success),
                ("left_task".to_owned(), TaskState::Failed),
                ("right_task".to_owned(), TaskState::UpstreamFailed),
            ]),
            get_dag_calls: AtomicUsize::new(0),
        })
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[test]
    fn task_states_map_to_local_states() {
        let cases = [
            (TaskState::Success, ExecutionStatus::Succeeded),
            (TaskState::Failed, ExecutionStatus::Failed),
            (TaskState::Skipped, ExecutionStatus::Canceled),
            (TaskState::Shutdown, ExecutionStatus::Canceled),
            (TaskState::UpForRetry, ExecutionStatus::Running),
            (TaskState::Deferred, ExecutionStatus::Running),
            (TaskState::None, ExecutionStatus::Pending),
        ];
        for (task, expected) in cases {
            assert_eq!(map_task_state(task).status, expected, "{task:?}");
        }
        assert_eq!(
            map_task_state(TaskState::Failed).failure_type,
            Some(crate::exec_state::FailureType::User)
        );
    }

    #[test]
    fn unknown_task_state_parses_as_none() {
        let state: TaskState = serde_json::from_str(r#""sensing""#).unwrap();
        assert_eq!(state, TaskState::None);
        let state: TaskState = serde_json::from_str(r#""up_for_reschedule""#).unwrap();
        assert_eq!(state, TaskState::UpForReschedule);
    }

    #[tokio::test]
    async fn imports_each_finished_run_once() {
        let (_db, pool) = migrated_pool().await;
        let bound = bound_dag(true);
        let (workflow, dag) = insert_dag(&pool, bound.dag).await;
        let scheduler = scripted(
            dag.id,
            vec![
                run("manual__1", 0, RemoteRunState::Success),
                run("manual__2", 1, RemoteRunState::Failed),
                run("manual__3", 2, RemoteRunState::Running),
                RemoteDagRun { start_date: None, ..run("queued__4", 3, RemoteRunState::Queued) },
            ],
        );
        let reconciler = Reconciler::new(pool.clone(), Arc::new(Fixed(scheduler.clone())));

        let report = reconciler.sync_all().await.unwrap();
        assert_eq!(report, SyncReport { imported_runs: 2, failed_dags: vec![] });

        // Nothing new the second time; the match is cached.
        let again = reconciler.sync_all().await.unwrap();
        assert_eq!(again.imported_runs, 0);
        assert_eq!(scheduler.get_dag_calls.load(Ordering::SeqCst), 1);

        let rows = results::get_dag_results_by_workflow(&pool, workflow.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let statuses: HashSet<&str> = rows.iter().map(|r| r.status.as_str()).collect();
        assert_eq!(statuses, HashSet::from(["succeeded", "failed"]));
        assert!(rows.iter().any(|r| r.created_at == run("x", 0, RemoteRunState::Success).start_date.unwrap()));

        let first = rows.iter().find(|r| r.status == "succeeded").unwrap();
        let ops = results::get_operator_results(&pool, first.id).await.unwrap();
        assert_eq!(ops.len(), 3);
        let extract = ops.iter().find(|r| r.operator_id == bound.extract).unwrap();
        assert_eq!(extract.status, "succeeded");

        // The shared artifact is recorded once, under the remote run's paths.
        let artifacts = results::get_artifact_results(&pool, first.id).await.unwrap();
        assert_eq!(artifacts.len(), 3);
        let rows_result = artifacts.iter().filter(|a| a.artifact_id == bound.rows).collect::<Vec<_>>();
        assert_eq!(rows_result.len(), 1);
        assert!(rows_result[0].content_path.starts_with("external/manual__1/"));
    }

    #[tokio::test]
    async fn runs_sharing_a_start_date_import_once_per_pass() {
        let (_db, pool) = migrated_pool().await;
        let (workflow, dag) = insert_dag(&pool, bound_dag(true).dag).await;
        let scheduler = scripted(
            dag.id,
            vec![
                run("manual__1", 5, RemoteRunState::Success),
                run("manual__2", 5, RemoteRunState::Failed),
            ],
        );
        let reconciler = Reconciler::new(pool.clone(), Arc::new(Fixed(scheduler)));

        assert_eq!(reconciler.sync_all().await.unwrap().imported_runs, 1);
        assert_eq!(reconciler.sync_all().await.unwrap().imported_runs, 0);

        let rows = results::get_dag_results_by_workflow(&pool, workflow.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "succeeded", "the first run listed wins");
    }

    #[tokio::test]
    async fn sub_second_start_dates_are_distinct_and_stable() {
        let (_db, pool) = migrated_pool().await;
        let (workflow, dag) = insert_dag(&pool, bound_dag(true).dag).await;

        let early = run("manual__1", 7, RemoteRunState::Success);
        let mut late = run("manual__2", 7, RemoteRunState::Success);
        late.start_date = early.start_date.map(|t| t + chrono::Duration::microseconds(250_123));
        let early_start = early.start_date.unwrap();
        let late_start = late.start_date.unwrap();

        let scheduler = scripted(dag.id, vec![early, late]);
        let reconciler = Reconciler::new(pool.clone(), Arc::new(Fixed(scheduler)));

        assert_eq!(reconciler.sync_all().await.unwrap().imported_runs, 2);
        // Stored timestamps keep their fraction, so nothing matches anew.
        assert_eq!(reconciler.sync_all().await.unwrap().imported_runs, 0);

        let rows = results::get_dag_results_by_workflow(&pool, workflow.id).await.unwrap();
        let starts: HashSet<DateTime<Utc>> = rows.iter().map(|r| r.created_at).collect();
        assert_eq!(starts, HashSet::from([early_start, late_start]));
    }

    #[tokio::test]
    async fn unmapped_operator_rolls_back_the_run() {
        let (_db, pool) = migrated_pool().await;
        let (workflow, dag) = insert_dag(&pool, bound_dag(false).dag).await;
        let scheduler = scripted(dag.id, vec![run("manual__1", 0, RemoteRunState::Success)]);
        let reconciler = Reconciler::new(pool.clone(), Arc::new(Fixed(scheduler)));

        let report = reconciler.sync_dags(&[dag.id]).await;
        assert_eq!(report.imported_runs, 0);
        assert_eq!(report.failed_dags, vec![dag.id]);
        assert!(results::get_dag_results_by_workflow(&pool, workflow.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mismatched_dag_is_isolated() {
        let (_db, pool) = migrated_pool().await;
        let (_, stale) = insert_dag(&pool, bound_dag(true).dag).await;
        let (workflow, current) = insert_dag(&pool, bound_dag(true).dag).await;

        // Tagged for `current` only.
        let scheduler = scripted(current.id, vec![run("manual__1", 0, RemoteRunState::Success)]);
        let reconciler = Reconciler::new(pool.clone(), Arc::new(Fixed(scheduler)));

        let report = reconciler.sync_dags(&[stale.id, current.id]).await;
        assert_eq!(report.failed_dags, vec![stale.id]);
        assert_eq!(report.imported_runs, 1);
        assert_eq!(results::get_dag_results_by_workflow(&pool, workflow.id).await.unwrap().len(), 1);

        let stored = WorkflowDag::from_rows(dags::get_dag(&pool, current.id).await.unwrap()).unwrap();
        assert!(stored.airflow().unwrap().matches_airflow);
        let stored = WorkflowDag::from_rows(dags::get_dag(&pool, stale.id).await.unwrap()).unwrap();
        assert!(!stored.airflow().unwrap().matches_airflow);
    }

    #[tokio::test]
    async fn local_dags_are_not_synced() {
        let (_db, pool) = migrated_pool().await;
        let mut b = DagBuilder::new();
        let param = b.op("param", OperatorKind::Param { value: "1".into() });
        b.produce(param, "value");
        let (_, local) = insert_dag(&pool, b.build()).await;

        let scheduler = scripted(local.id, vec![run("manual__1", 0, RemoteRunState::Success)]);
        let reconciler = Reconciler::new(pool.clone(), Arc::new(Fixed(scheduler)));

        assert_eq!(reconciler.sync_all().await.unwrap(), SyncReport::default());
        assert_eq!(reconciler.sync_dags(&[local.id]).await.failed_dags, vec![local.id]);
    }
}
