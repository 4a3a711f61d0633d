//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine (validation, lifecycle, sync).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(Uuid),

    /// An edge references a node ID that doesn't exist in the DAG.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: Uuid,
        side: &'static str,
    },

    /// An edge connects two operators or two artifacts.
    #[error("edge {from} -> {to} must connect an operator and an artifact")]
    InvalidEdge { from: Uuid, to: Uuid },

    /// An artifact must be produced by exactly one operator.
    #[error("artifact '{artifact_id}' has {producers} producing operators, expected exactly one")]
    ArtifactProducers { artifact_id: Uuid, producers: usize },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// An operator's spec does not fit its inputs/outputs.
    #[error("operator '{operator}' is invalid: {message}")]
    InvalidOperator { operator: String, message: String },

    // ------ Usage errors ------

    /// A lifecycle method was called out of order or in the wrong mode.
    /// These are programming errors and are never retried.
    #[error("precondition violated: {0}")]
    Precondition(String),

    // ------ Infrastructure errors ------

    /// Blob storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Job manager failure.
    #[error("job manager error: {0}")]
    Job(#[from] jobs::JobError),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    /// A stored value could not be decoded.
    #[error("malformed stored value: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored row holds a value outside its domain.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// Transport failure talking to an external scheduler.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The external scheduler rejected a request or disagrees with local state.
    #[error("external scheduler error: {0}")]
    Scheduler(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(db::DbError::Sqlx(err))
    }
}

impl EngineError {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}
