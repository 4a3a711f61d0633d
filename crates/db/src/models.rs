//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models; they carry no domain behaviour.
//! JSON columns (`spec`, `exec_state`, configs) are kept as raw
//! `serde_json::Value`; domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Status shared by DAG, operator and artifact results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Registered,
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    /// Whether no further transitions can happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Pending    => write!(f, "pending"),
            Self::Running    => write!(f, "running"),
            Self::Succeeded  => write!(f, "succeeded"),
            Self::Failed     => write!(f, "failed"),
            Self::Canceled   => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "pending"    => Ok(Self::Pending),
            "running"    => Ok(Self::Running),
            "succeeded"  => Ok(Self::Succeeded),
            "failed"     => Ok(Self::Failed),
            "canceled"   => Ok(Self::Canceled),
            other        => Err(format!("unknown execution status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// workflows / workflow_dags
// ---------------------------------------------------------------------------

/// A persisted workflow row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub schedule: serde_json::Value,
    pub retention_policy: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted, immutable DAG version.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowDagRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub storage_config: serde_json::Value,
    pub engine_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted operator node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OperatorRow {
    pub id: Uuid,
    pub workflow_dag_id: Uuid,
    pub name: String,
    pub description: String,
    /// Tagged operator spec.
    pub spec: serde_json::Value,
}

/// A persisted artifact node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArtifactRow {
    pub id: Uuid,
    pub workflow_dag_id: Uuid,
    pub name: String,
    pub description: String,
    #[sqlx(rename = "type")]
    pub artifact_type: String,
}

/// Direction of a DAG edge.
pub const OPERATOR_TO_ARTIFACT: &str = "operator_to_artifact";
pub const ARTIFACT_TO_OPERATOR: &str = "artifact_to_operator";

/// A persisted DAG edge.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EdgeRow {
    pub workflow_dag_id: Uuid,
    pub edge_type: String,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub idx: i64,
}

// ---------------------------------------------------------------------------
// results
// ---------------------------------------------------------------------------

/// One execution of a DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DagResultRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_dag_id: Uuid,
    pub status: String,
    pub exec_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// The result of one operator within one DAG result.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OperatorResultRow {
    pub id: Uuid,
    pub dag_result_id: Uuid,
    pub operator_id: Uuid,
    pub status: String,
    pub exec_state: Option<serde_json::Value>,
}

/// The result of one artifact within one DAG result.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArtifactResultRow {
    pub id: Uuid,
    pub dag_result_id: Uuid,
    pub artifact_id: Uuid,
    pub content_path: String,
    pub status: String,
    pub exec_state: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}
