//! Local-disk storage backend.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::{Storage, StorageError};

/// Stores every blob as a file below `root`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `path` below the root, rejecting anything that would escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    if source.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_owned())
    } else {
        StorageError::Io { path: path.to_owned(), source }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| io_error(path, e))
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        tokio::fs::write(&full, data).await.map_err(|e| io_error(path, e))?;
        debug!(path, bytes = data.len(), "wrote blob");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full).await.map_err(|e| io_error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(dst, e))?;
        }
        tokio::fs::copy(&from, &to).await.map_err(|e| io_error(src, e))?;
        Ok(())
    }
}
