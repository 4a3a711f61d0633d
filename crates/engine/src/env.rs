//! Dependencies handed to every operator and artifact of a run.

use std::sync::Arc;

use db::DbPool;
use jobs::JobManager;
use storage::{Storage, StorageConfig};

use crate::preview_cache::PreviewCacheManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Results are discarded; outputs may be served from the preview cache.
    Preview,
    /// Results are written to the relational store.
    Publish,
}

/// Explicit dependency injection for one run. No globals.
///
/// `results` and `preview_cache` are mutually exclusive; operators and
/// artifacts refuse to be built from an env that carries both.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub job_manager: Arc<dyn JobManager>,
    pub storage: Arc<dyn Storage>,
    pub storage_config: StorageConfig,
    /// Result writer. Present only in publish mode.
    pub results: Option<DbPool>,
    pub preview_cache: Option<Arc<dyn PreviewCacheManager>>,
}

impl ExecutionEnv {
    pub fn publish(
        job_manager: Arc<dyn JobManager>,
        storage: Arc<dyn Storage>,
        storage_config: StorageConfig,
        results: DbPool,
    ) -> Self {
        Self { job_manager, storage, storage_config, results: Some(results), preview_cache: None }
    }

    pub fn preview(
        job_manager: Arc<dyn JobManager>,
        storage: Arc<dyn Storage>,
        storage_config: StorageConfig,
        preview_cache: Option<Arc<dyn PreviewCacheManager>>,
    ) -> Self {
        Self { job_manager, storage, storage_config, results: None, preview_cache }
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.results.is_some() { ExecutionMode::Publish } else { ExecutionMode::Preview }
    }
}

impl std::fmt::Debug for ExecutionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnv")
            .field("job_manager", &self.job_manager.kind())
            .field("storage_config", &self.storage_config)
            .field("mode", &self.mode())
            .field("cache_aware", &self.preview_cache.is_some())
            .finish()
    }
}
