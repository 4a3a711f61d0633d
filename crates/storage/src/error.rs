//! Typed error type for the storage crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no object stored at '{0}'")]
    NotFound(String),

    #[error("invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("storage backend '{0}' is not available in this build")]
    Unsupported(String),

    #[error("i/o error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
