//! `storage` crate: blob storage keyed by string paths.
//!
//! Every DAG carries one [`StorageConfig`]; all blobs written for its runs
//! (artifact content, artifact metadata, operator metadata, serialized
//! functions) live under that backend. The engine only relies on the narrow
//! [`Storage`] contract defined here.

pub mod config;
pub mod error;
pub mod file;

use std::sync::Arc;

use async_trait::async_trait;

pub use config::StorageConfig;
pub use error::StorageError;
pub use file::FileStorage;

/// Narrow read/write contract over a blob backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the full blob at `path`.
    ///
    /// Returns [`StorageError::NotFound`] when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write (or overwrite) the blob at `path`.
    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Whether a blob is stored at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Remove the blob at `path`. Deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Copy `src` to `dst` within the same backend.
    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let data = self.get(src).await?;
        self.put(dst, &data).await
    }
}

/// Open the backend described by `config`.
///
/// Object-store backends are served by external clients; only the local
/// filesystem backend is built in.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config {
        StorageConfig::File { directory } => Ok(Arc::new(FileStorage::new(directory.clone()))),
        other => Err(StorageError::Unsupported(other.kind().to_string())),
    }
}
