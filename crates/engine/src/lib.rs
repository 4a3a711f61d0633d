//! `engine` crate: domain models, DAG validation, the operator/artifact
//! execution lifecycle, the preview cache and external-engine reconciliation.

pub mod advisory;
pub mod artifact;
pub mod dag;
pub mod env;
pub mod error;
pub mod exec_state;
pub mod executor;
pub mod models;
pub mod operator;
pub mod paths;
pub mod preview_cache;
pub mod reconcile;

pub use artifact::Artifact;
pub use dag::{compute_signatures, validate_dag, DagPlan};
pub use env::{ExecutionEnv, ExecutionMode};
pub use error::EngineError;
pub use exec_state::{derive_state, ExecutionState, FailureType};
pub use executor::{ExecutionResult, ExecutorConfig, WorkflowExecutor};
pub use models::{Workflow, WorkflowDag, OperatorDef, ArtifactDef, DagEdge};
pub use operator::Operator;
pub use paths::ExecPaths;
pub use preview_cache::{PreviewCacheManager, StoragePreviewCache};
pub use reconcile::Reconciler;

#[cfg(test)]
pub(crate) mod test_support;
