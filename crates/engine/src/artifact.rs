//! Artifact lifecycle within one run.
//!
//! An [`Artifact`] is the run-scoped handle on one artifact node: where its
//! blobs live, whether they have been written, and its result row. It is
//! either cache-aware (previews with a cache manager, keyed by signature) or
//! persisted (publish runs, with a result writer), never both.

use std::sync::Arc;

use db::{models::ExecutionStatus, repository::{dags, results}, DbPool};
use jobs::ArtifactType;
use storage::Storage;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    advisory::advise,
    env::ExecutionEnv,
    error::EngineError,
    exec_state::ExecutionState,
    models::{ArtifactDef, ArtifactMetadata},
    paths::ExecPaths,
    preview_cache::PreviewCacheManager,
};

pub struct Artifact {
    id: Uuid,
    name: String,
    artifact_type: ArtifactType,
    signature: Option<Uuid>,
    paths: ExecPaths,
    storage: Arc<dyn Storage>,
    results: Option<DbPool>,
    preview_cache: Option<Arc<dyn PreviewCacheManager>>,
    result_id: Option<Uuid>,
    results_persisted: bool,
}

impl Artifact {
    /// Build the run handle for `def`.
    ///
    /// A signature is required exactly when the env carries a preview cache
    /// manager, and a cache manager cannot be combined with a result writer.
    pub fn new(
        def: &ArtifactDef,
        signature: Option<Uuid>,
        paths: ExecPaths,
        env: &ExecutionEnv,
    ) -> Result<Self, EngineError> {
        if env.preview_cache.is_some() && env.results.is_some() {
            return Err(EngineError::precondition(format!(
                "artifact {}: cache-aware artifacts cannot be persisted",
                def.id
            )));
        }
        match (signature, env.preview_cache.is_some()) {
            (None, true) => {
                return Err(EngineError::precondition(format!(
                    "artifact {}: a signature is required when a preview cache manager is supplied",
                    def.id
                )));
            }
            (Some(_), false) => {
                return Err(EngineError::precondition(format!(
                    "artifact {}: a signature is only valid for cache-aware artifacts",
                    def.id
                )));
            }
            _ => {}
        }

        Ok(Self {
            id: def.id,
            name: def.name.clone(),
            artifact_type: def.artifact_type,
            signature,
            paths,
            storage: env.storage.clone(),
            results: env.results.clone(),
            preview_cache: env.preview_cache.clone(),
            result_id: None,
            results_persisted: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artifact_type(&self) -> ArtifactType {
        self.artifact_type
    }

    pub fn signature(&self) -> Option<Uuid> {
        self.signature
    }

    pub fn paths(&self) -> &ExecPaths {
        &self.paths
    }

    pub fn results_persisted(&self) -> bool {
        self.results_persisted
    }

    /// Whether the producer has written this artifact. A storage error is
    /// treated as "not yet".
    pub async fn computed(&self) -> bool {
        match self.storage.exists(&self.paths.artifact_metadata_path).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(artifact = %self.id, error = %err, "unable to check artifact metadata");
                false
            }
        }
    }

    /// Create this artifact's result row (Pending) under `dag_result_id`.
    pub async fn initialize_result(&mut self, dag_result_id: Uuid) -> Result<(), EngineError> {
        let pool = self.results.as_ref().ok_or_else(|| {
            EngineError::precondition(format!("artifact {}: result writer is missing", self.id))
        })?;

        let row = results::create_artifact_result(
            pool,
            dag_result_id,
            self.id,
            &self.paths.artifact_content_path,
            ExecutionStatus::Pending,
            None,
        )
        .await?;

        self.result_id = Some(row.id);
        Ok(())
    }

    /// Write the terminal `exec_state` (and metadata, if computed) to the
    /// result row. Allowed once.
    pub async fn persist_result(&mut self, exec_state: &ExecutionState) -> Result<(), EngineError> {
        if self.preview_cache.is_some() {
            return Err(EngineError::precondition(format!(
                "artifact {}: cache-aware artifacts cannot be persisted",
                self.id
            )));
        }
        if self.results_persisted {
            return Err(EngineError::precondition(format!(
                "artifact {}: results have already been persisted",
                self.id
            )));
        }
        if !exec_state.terminated() {
            return Err(EngineError::precondition(format!(
                "artifact {}: cannot persist a {} state",
                self.id, exec_state.status
            )));
        }
        let (Some(pool), Some(result_id)) = (self.results.clone(), self.result_id) else {
            return Err(EngineError::precondition(format!(
                "artifact {}: initialize_result must be called before persist_result",
                self.id
            )));
        };

        // Metadata is optional: a failed producer writes none, and a
        // corrupt blob should not cost us the status.
        let metadata = if self.computed().await {
            match self.get_metadata().await {
                Ok(m) => Some(m),
                Err(err) => {
                    warn!(artifact = %self.id, error = %err, "unable to read artifact metadata");
                    None
                }
            }
        } else {
            None
        };
        let metadata_value = metadata.as_ref().map(serde_json::to_value).transpose()?;

        results::update_artifact_result(
            &pool,
            result_id,
            exec_state.status,
            serde_json::to_value(exec_state)?,
            metadata_value,
        )
        .await?;
        self.results_persisted = true;

        if let Some(observed) = metadata.and_then(|m| m.artifact_type) {
            advise("artifact type promotion", self.promote_type(&pool, observed).await);
        }
        Ok(())
    }

    /// Replace an `Untyped` declaration with the type the producer observed.
    async fn promote_type(&mut self, pool: &DbPool, observed: ArtifactType) -> Result<(), EngineError> {
        if self.artifact_type != ArtifactType::Untyped || observed == ArtifactType::Untyped {
            return Ok(());
        }
        dags::update_artifact_type(pool, self.id, observed.as_str()).await?;
        debug!(artifact = %self.id, %observed, "promoted artifact type");
        self.artifact_type = observed;
        Ok(())
    }

    /// Release the handle. A computed, unpersisted, cache-aware artifact is
    /// registered in the preview cache.
    pub async fn finish(self) {
        if !self.computed().await || self.results_persisted {
            return;
        }
        if let (Some(cache), Some(signature)) = (&self.preview_cache, self.signature) {
            advise("preview cache put", cache.put(signature, &self.paths).await);
        }
    }

    pub async fn get_metadata(&self) -> Result<ArtifactMetadata, EngineError> {
        self.ensure_computed().await?;
        let bytes = self.storage.get(&self.paths.artifact_metadata_path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_content(&self) -> Result<Vec<u8>, EngineError> {
        self.ensure_computed().await?;
        Ok(self.storage.get(&self.paths.artifact_content_path).await?)
    }

    async fn ensure_computed(&self) -> Result<(), EngineError> {
        if self.computed().await {
            Ok(())
        } else {
            Err(EngineError::precondition(format!(
                "artifact {} has not been computed",
                self.id
            )))
        }
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.artifact_type)
            .field("signature", &self.signature)
            .field("results_persisted", &self.results_persisted)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview_cache::StoragePreviewCache;
    use crate::test_support::{migrated_pool, persisted_dag, write_blobs, TestEnv};
    use db::repository::{dags, results};

    fn def(id: Uuid) -> ArtifactDef {
        ArtifactDef {
            id,
            name: "out".into(),
            description: String::new(),
            artifact_type: ArtifactType::Untyped,
        }
    }

    #[tokio::test]
    async fn cache_awareness_and_signature_must_agree() {
        let t = TestEnv::new();
        let paths = ExecPaths::for_run(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let cached = t.preview_env(true);
        let err = Artifact::new(&def(Uuid::new_v4()), None, paths.clone(), &cached).unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));

        let uncached = t.preview_env(false);
        let err = Artifact::new(&def(Uuid::new_v4()), Some(Uuid::new_v4()), paths.clone(), &uncached)
            .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));

        assert!(Artifact::new(&def(Uuid::new_v4()), Some(Uuid::new_v4()), paths, &cached).is_ok());
    }

    #[tokio::test]
    async fn cache_manager_and_result_writer_are_exclusive() {
        let t = TestEnv::new();
        let (_db_dir, pool) = migrated_pool().await;
        let mut env = t.preview_env(true);
        env.results = Some(pool);

        let paths = ExecPaths::for_run(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let err = Artifact::new(&def(Uuid::new_v4()), Some(Uuid::new_v4()), paths, &env).unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }

    #[tokio::test]
    async fn metadata_requires_computed_artifact() {
        let t = TestEnv::new();
        let paths = ExecPaths::for_run(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let artifact = Artifact::new(&def(Uuid::new_v4()), None, paths.clone(), &t.preview_env(false)).unwrap();

        assert!(!artifact.computed().await);
        assert!(matches!(artifact.get_metadata().await, Err(EngineError::Precondition(_))));
        assert!(matches!(artifact.get_content().await, Err(EngineError::Precondition(_))));

        write_blobs(t.storage.as_ref(), &paths).await;
        assert!(artifact.computed().await);
        assert_eq!(artifact.get_content().await.unwrap(), b"content".to_vec());
        assert_eq!(artifact.get_metadata().await.unwrap().artifact_type, Some(ArtifactType::Table));
    }

    #[tokio::test]
    async fn persist_folds_metadata_promotes_type_and_runs_once() {
        let t = TestEnv::new();
        let (_db_dir, pool) = migrated_pool().await;
        let fixture = persisted_dag(&pool, &t).await;
        let artifact_def = fixture.dag.artifacts[0].clone();
        let env = t.publish_env(pool.clone());

        let paths = ExecPaths::for_run(fixture.dag_result_id, artifact_def.id, Uuid::new_v4());
        let mut artifact = Artifact::new(&artifact_def, None, paths.clone(), &env).unwrap();
        artifact.initialize_result(fixture.dag_result_id).await.unwrap();

        let pending = ExecutionState::pending();
        assert!(matches!(artifact.persist_result(&pending).await, Err(EngineError::Precondition(_))));

        write_blobs(t.storage.as_ref(), &paths).await;
        let done = ExecutionState::new(ExecutionStatus::Succeeded);
        artifact.persist_result(&done).await.unwrap();
        assert!(artifact.results_persisted());
        assert_eq!(artifact.artifact_type(), ArtifactType::Table);

        let err = artifact.persist_result(&done).await.unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));

        let rows = results::get_artifact_results(&pool, fixture.dag_result_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "succeeded");
        assert_eq!(rows[0].metadata.as_ref().unwrap()["artifact_type"], "table");

        let stored = dags::get_artifact(&pool, artifact_def.id).await.unwrap();
        assert_eq!(stored.artifact_type, "table");
    }

    #[tokio::test]
    async fn persist_without_blobs_writes_status_only() {
        let t = TestEnv::new();
        let (_db_dir, pool) = migrated_pool().await;
        let fixture = persisted_dag(&pool, &t).await;
        let artifact_def = fixture.dag.artifacts[0].clone();

        let paths = ExecPaths::for_run(fixture.dag_result_id, artifact_def.id, Uuid::new_v4());
        let mut artifact = Artifact::new(&artifact_def, None, paths, &t.publish_env(pool.clone())).unwrap();
        artifact.initialize_result(fixture.dag_result_id).await.unwrap();
        artifact
            .persist_result(&ExecutionState::system_failure("worker died"))
            .await
            .unwrap();

        let rows = results::get_artifact_results(&pool, fixture.dag_result_id).await.unwrap();
        assert_eq!(rows[0].status, "failed");
        assert!(rows[0].metadata.is_none());
        assert_eq!(dags::get_artifact(&pool, artifact_def.id).await.unwrap().artifact_type, "untyped");
    }

    #[tokio::test]
    async fn persist_requires_initialized_result() {
        let t = TestEnv::new();
        let (_db_dir, pool) = migrated_pool().await;
        let paths = ExecPaths::for_run(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut artifact = Artifact::new(&def(Uuid::new_v4()), None, paths, &t.publish_env(pool)).unwrap();

        let err = artifact
            .persist_result(&ExecutionState::new(ExecutionStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
        assert!(!artifact.results_persisted());
    }

    #[tokio::test]
    async fn finish_registers_computed_cache_aware_artifacts() {
        let t = TestEnv::new();
        let cache = Arc::new(StoragePreviewCache::new(t.storage.clone()));
        let env = t.preview_env_with(cache.clone());
        let signature = Uuid::new_v4();

        let paths = ExecPaths::for_run(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let uncomputed = Artifact::new(&def(Uuid::new_v4()), Some(signature), paths.clone(), &env).unwrap();
        uncomputed.finish().await;
        assert!(cache.is_empty());

        write_blobs(t.storage.as_ref(), &paths).await;
        let computed = Artifact::new(&def(Uuid::new_v4()), Some(signature), paths.clone(), &env).unwrap();
        computed.finish().await;

        let lookup = cache.get_multi(&[signature]).await.unwrap();
        assert!(lookup.all_hit);
        assert_eq!(lookup.entries[&signature].paths, paths);
    }
}
