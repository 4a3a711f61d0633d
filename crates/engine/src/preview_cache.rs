//! Preview cache: reuse of artifacts computed by earlier previews.
//!
//! Entries are keyed by artifact *signature*, which encodes everything
//! upstream of an artifact. A hit means the blobs at the entry's paths are
//! exactly what a fresh run would produce.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use storage::Storage;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{advisory::advise, error::EngineError, paths::ExecPaths};

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewCacheEntry {
    pub signature: Uuid,
    pub paths: ExecPaths,
}

/// Result of [`PreviewCacheManager::get_multi`].
///
/// Lookups are all-or-nothing: on a miss `entries` is empty, so callers can
/// never act on a partial result.
#[derive(Debug, Clone, Default)]
pub struct CacheLookup {
    pub all_hit: bool,
    pub entries: HashMap<Uuid, PreviewCacheEntry>,
}

impl CacheLookup {
    pub fn miss() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait PreviewCacheManager: Send + Sync {
    /// Look up every signature. `all_hit` is true only if all of them are
    /// cached; an empty request is a miss.
    async fn get_multi(&self, signatures: &[Uuid]) -> Result<CacheLookup, EngineError>;

    /// Register the blobs at `paths` under `signature`. The first writer
    /// for a signature wins; later puts are no-ops.
    async fn put(&self, signature: Uuid, paths: &ExecPaths) -> Result<(), EngineError>;
}

/// Where the index entry for `signature` is stored.
pub fn index_path(signature: Uuid) -> String {
    format!("preview_cache/{signature}")
}

/// Cache index kept in the DAG's own storage, next to the blobs it points
/// at, so separate processes share entries. Entries already read or written
/// are remembered in memory.
pub struct StoragePreviewCache {
    storage: Arc<dyn Storage>,
    known: RwLock<HashMap<Uuid, PreviewCacheEntry>>,
}

impl StoragePreviewCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage, known: RwLock::new(HashMap::new()) }
    }

    async fn blobs_exist(&self, paths: &ExecPaths) -> Result<bool, EngineError> {
        Ok(self.storage.exists(&paths.artifact_content_path).await?
            && self.storage.exists(&paths.artifact_metadata_path).await?
            && self.storage.exists(&paths.op_metadata_path).await?)
    }

    /// The entry for `signature`, from memory or from its index blob.
    async fn entry(&self, signature: Uuid) -> Result<Option<PreviewCacheEntry>, EngineError> {
        let cached = self.known.read().get(&signature).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let path = index_path(signature);
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        let entry: PreviewCacheEntry = match serde_json::from_slice(&self.storage.get(&path).await?) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%signature, error = %err, "ignoring unreadable preview cache entry");
                return Ok(None);
            }
        };
        self.known.write().insert(signature, entry.clone());
        Ok(Some(entry))
    }

    async fn evict(&self, signature: Uuid) {
        self.known.write().remove(&signature);
        advise("preview cache eviction", self.storage.delete(&index_path(signature)).await);
    }
}

#[async_trait]
impl PreviewCacheManager for StoragePreviewCache {
    async fn get_multi(&self, signatures: &[Uuid]) -> Result<CacheLookup, EngineError> {
        if signatures.is_empty() {
            return Ok(CacheLookup::miss());
        }

        let mut found = HashMap::with_capacity(signatures.len());
        for &signature in signatures {
            let Some(entry) = self.entry(signature).await? else {
                return Ok(CacheLookup::miss());
            };
            // Blobs may have been removed since they were registered.
            if !self.blobs_exist(&entry.paths).await? {
                debug!(%signature, "dropping stale preview cache entry");
                self.evict(signature).await;
                return Ok(CacheLookup::miss());
            }
            found.insert(signature, entry);
        }

        Ok(CacheLookup { all_hit: true, entries: found })
    }

    async fn put(&self, signature: Uuid, paths: &ExecPaths) -> Result<(), EngineError> {
        if !self.blobs_exist(paths).await? {
            return Err(EngineError::precondition(format!(
                "cannot cache signature {signature}: blobs at {} are missing",
                paths.artifact_content_path
            )));
        }

        if self.entry(signature).await?.is_some() {
            debug!(%signature, "signature already cached, keeping first writer");
            return Ok(());
        }
        let entry = PreviewCacheEntry { signature, paths: paths.clone() };
        self.storage.put(&index_path(signature), &serde_json::to_vec(&entry)?).await?;
        self.known.write().insert(signature, entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
