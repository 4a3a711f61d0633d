//! Shared fixtures for the engine's unit tests.

use std::sync::Arc;

use chrono::Utc;
use db::{
    models::ExecutionStatus,
    pool::{create_pool, run_migrations},
    repository::{dags, results, workflows},
    DbPool,
};
use jobs::{mock::MockJobManager, ArtifactType, JobManager};
use serde_json::json;
use storage::{FileStorage, Storage, StorageConfig};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    env::ExecutionEnv,
    models::{
        ArtifactDef, DagEdge, EngineConfig, FunctionSpec, OperatorDef, OperatorKind, OperatorSpec,
        Workflow, WorkflowDag,
    },
    paths::ExecPaths,
    preview_cache::{PreviewCacheManager, StoragePreviewCache},
};

/// A function-style operator kind with a throwaway function path.
pub fn function_kind() -> OperatorKind {
    OperatorKind::Function(FunctionSpec {
        storage_path: format!("functions/{}", Uuid::new_v4()),
        entry_point: None,
        custom_args: String::new(),
    })
}

/// Write content, artifact metadata and a succeeded operator metadata blob.
pub async fn write_blobs(storage: &dyn Storage, paths: &ExecPaths) {
    storage.put(&paths.artifact_content_path, b"content").await.unwrap();
    storage
        .put(
            &paths.artifact_metadata_path,
            &serde_json::to_vec(&json!({
                "schema": [{ "col": "int" }],
                "system_metadata": {},
                "artifact_type": "table",
                "serialization_type": "table"
            }))
            .unwrap(),
        )
        .await
        .unwrap();
    storage
        .put(&paths.op_metadata_path, br#"{"status":"succeeded"}"#)
        .await
        .unwrap();
}

pub async fn migrated_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("engine.db").display());
    let pool = create_pool(&url, 4).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (dir, pool)
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// File-backed storage in a temp dir plus a mock job manager that plays
/// the worker against it.
pub struct TestEnv {
    _dir: TempDir,
    pub storage: Arc<dyn Storage>,
    pub storage_config: StorageConfig,
    pub jobs: Arc<MockJobManager>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        let storage_config = StorageConfig::File { directory: dir.path().to_path_buf() };
        let jobs = Arc::new(MockJobManager::succeeding(storage.clone()));
        Self { _dir: dir, storage, storage_config, jobs }
    }

    /// Replace the job manager, keeping the storage.
    pub fn with_jobs(mut self, jobs: MockJobManager) -> Self {
        self.jobs = Arc::new(jobs);
        self
    }

    fn job_manager(&self) -> Arc<dyn JobManager> {
        self.jobs.clone()
    }

    /// Preview env; `cache_aware` attaches a fresh storage-backed cache.
    pub fn preview_env(&self, cache_aware: bool) -> ExecutionEnv {
        let cache: Option<Arc<dyn PreviewCacheManager>> = if cache_aware {
            Some(Arc::new(StoragePreviewCache::new(self.storage.clone())))
        } else {
            None
        };
        ExecutionEnv::preview(self.job_manager(), self.storage.clone(), self.storage_config.clone(), cache)
    }

    pub fn preview_env_with(&self, cache: Arc<StoragePreviewCache>) -> ExecutionEnv {
        ExecutionEnv::preview(
            self.job_manager(),
            self.storage.clone(),
            self.storage_config.clone(),
            Some(cache),
        )
    }

    pub fn publish_env(&self, pool: DbPool) -> ExecutionEnv {
        ExecutionEnv::publish(self.job_manager(), self.storage.clone(), self.storage_config.clone(), pool)
    }
}

// ---------------------------------------------------------------------------
// DAG construction
// ---------------------------------------------------------------------------

/// Incremental DAG construction for tests. Edge indices are assigned in
/// call order unless given explicitly.
pub struct DagBuilder {
    dag: WorkflowDag,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self {
            dag: WorkflowDag {
                id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                operators: Vec::new(),
                artifacts: Vec::new(),
                edges: Vec::new(),
                storage_config: StorageConfig::File { directory: "/tmp/unused".into() },
                engine_config: EngineConfig::Local,
                created_at: Utc::now(),
            },
        }
    }

    pub fn workflow_id(mut self, id: Uuid) -> Self {
        self.dag.workflow_id = id;
        self
    }

    pub fn storage(mut self, config: StorageConfig) -> Self {
        self.dag.storage_config = config;
        self
    }

    pub fn op(&mut self, name: &str, kind: OperatorKind) -> Uuid {
        let id = Uuid::new_v4();
        self.dag.operators.push(OperatorDef {
            id,
            name: name.into(),
            description: String::new(),
            spec: OperatorSpec::new(kind),
        });
        id
    }

    pub fn artifact(&mut self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.dag.artifacts.push(ArtifactDef {
            id,
            name: name.into(),
            description: String::new(),
            artifact_type: ArtifactType::Untyped,
        });
        id
    }

    /// New artifact produced by `op`.
    pub fn produce(&mut self, op: Uuid, name: &str) -> Uuid {
        let artifact = self.artifact(name);
        let idx = self.dag.edges.iter().filter(|e| e.from == op).count() as u32;
        self.edge_at(op, artifact, idx);
        artifact
    }

    /// `op` consumes `artifact` as its next input.
    pub fn consume(&mut self, artifact: Uuid, op: Uuid) {
        let idx = self.dag.edges.iter().filter(|e| e.to == op).count() as u32;
        self.edge_at(artifact, op, idx);
    }

    pub fn edge_at(&mut self, from: Uuid, to: Uuid, idx: u32) {
        self.dag.edges.push(DagEdge { from, to, idx });
    }

    pub fn build(self) -> WorkflowDag {
        self.dag
    }
}

// ---------------------------------------------------------------------------
// Persisted fixtures
// ---------------------------------------------------------------------------

pub struct PersistedDag {
    pub workflow: Workflow,
    pub dag: WorkflowDag,
    pub dag_result_id: Uuid,
}

/// Insert a workflow and `dag` (rebound to it), without a DAG result.
pub async fn insert_dag(pool: &DbPool, mut dag: WorkflowDag) -> (Workflow, WorkflowDag) {
    let workflow = Workflow::new("test-workflow");
    workflows::create_workflow(
        pool,
        workflow.id,
        &workflow.name,
        &workflow.description,
        serde_json::to_value(&workflow.schedule).unwrap(),
        serde_json::to_value(workflow.retention_policy).unwrap(),
    )
    .await
    .unwrap();

    dag.workflow_id = workflow.id;
    dags::create_dag(pool, &dag.to_rows().unwrap()).await.unwrap();
    (workflow, dag)
}

/// A persisted `param -> artifact` DAG with one running DAG result.
pub async fn persisted_dag(pool: &DbPool, env: &TestEnv) -> PersistedDag {
    let mut b = DagBuilder::new().storage(env.storage_config.clone());
    let param = b.op("param", OperatorKind::Param { value: "42".into() });
    b.produce(param, "value");
    let (workflow, dag) = insert_dag(pool, b.build()).await;

    let row = results::create_dag_result(
        pool,
        workflow.id,
        dag.id,
        ExecutionStatus::Running,
        None,
        Utc::now(),
    )
    .await
    .unwrap();

    PersistedDag { workflow, dag, dag_result_id: row.id }
}
