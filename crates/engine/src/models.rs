//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. They convert to and from the row structs of the `db` crate, whose
//! JSON columns hold the serialised form of the nested types here.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use db::{
    models::{
        ArtifactRow, EdgeRow, OperatorRow, WorkflowDagRow, WorkflowRow, ARTIFACT_TO_OPERATOR,
        OPERATOR_TO_ARTIFACT,
    },
    repository::dags::DagRows,
};
use jobs::{ArtifactType, OperatorType};
use jobs::spec::{CheckSeverity, EntryPoint, Resources};
use serde::{Deserialize, Serialize};
use storage::StorageConfig;
use uuid::Uuid;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// How new runs of a workflow are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTrigger {
    #[default]
    Manual,
    /// Cron-driven.
    Periodic,
    /// Runs are owned by an external Airflow deployment.
    Airflow,
    /// Triggered by the completion of another workflow.
    Cascade,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub trigger: UpdateTrigger,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_schedule: String,
    #[serde(default)]
    pub disable_manual_trigger: bool,
    #[serde(default)]
    pub paused: bool,
    /// Upstream workflows for [`UpdateTrigger::Cascade`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ids: Vec<Uuid>,
}

/// How many DAG results to keep per workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep only the K most recent runs. Zero or negative keeps everything.
    #[serde(default)]
    pub k_latest_runs: i64,
}

/// A named container of DAG versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            schedule: Schedule::default(),
            retention_policy: RetentionPolicy::default(),
            created_at: Utc::now(),
        }
    }

    pub fn from_row(row: WorkflowRow) -> Result<Self, EngineError> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            schedule: serde_json::from_value(row.schedule)?,
            retention_policy: serde_json::from_value(row.retention_policy)?,
            created_at: row.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Operator specs
// ---------------------------------------------------------------------------

/// Serialized user code for function-style operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Storage path of the serialized function bundle.
    pub storage_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<EntryPoint>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_args: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub function: FunctionSpec,
    pub level: CheckSeverity,
}

/// Connector parameters for extract/load operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpec {
    pub integration_id: Uuid,
    /// Connector service name, e.g. `postgres` or `s3`.
    pub service: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// What an operator does. Dispatch over this is exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorKind {
    Function(FunctionSpec),
    Metric(FunctionSpec),
    Check(CheckSpec),
    Extract(ConnectorSpec),
    Load(ConnectorSpec),
    Param { value: String },
    SystemMetric { metric_name: String },
}

impl OperatorKind {
    pub fn operator_type(&self) -> OperatorType {
        match self {
            Self::Function(_)         => OperatorType::Function,
            Self::Metric(_)           => OperatorType::Metric,
            Self::Check(_)            => OperatorType::Check,
            Self::Extract(_)          => OperatorType::Extract,
            Self::Load(_)             => OperatorType::Load,
            Self::Param { .. }        => OperatorType::Param,
            Self::SystemMetric { .. } => OperatorType::SystemMetric,
        }
    }

    /// The serialized function, for operators that run user code.
    pub fn function(&self) -> Option<&FunctionSpec> {
        match self {
            Self::Function(f) | Self::Metric(f) => Some(f),
            Self::Check(c) => Some(&c.function),
            _ => None,
        }
    }
}

/// Tagged operator spec plus optional resource constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSpec {
    #[serde(flatten)]
    pub kind: OperatorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

impl OperatorSpec {
    pub fn new(kind: OperatorKind) -> Self {
        Self { kind, resources: None }
    }
}

// ---------------------------------------------------------------------------
// DAG nodes and edges
// ---------------------------------------------------------------------------

/// An immutable operator node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorDef {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub spec: OperatorSpec,
}

/// An artifact node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDef {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "untyped")]
    pub artifact_type: ArtifactType,
}

fn untyped() -> ArtifactType {
    ArtifactType::Untyped
}

/// Directed edge between an operator and an artifact (either direction).
///
/// `idx` orders an operator's inputs, or its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEdge {
    pub from: Uuid,
    pub to: Uuid,
    #[serde(default)]
    pub idx: u32,
}

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Binding of a DAG to an external Airflow deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirflowConfig {
    pub integration_id: Uuid,
    /// The remote DAG id.
    pub dag_id: String,
    /// Local operator id -> remote task id.
    #[serde(default)]
    pub operator_to_task: HashMap<Uuid, String>,
    /// Cached result of a positive structural match.
    #[serde(default)]
    pub matches_airflow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineConfig {
    #[default]
    Local,
    Airflow(AirflowConfig),
}

impl EngineConfig {
    /// Value of the `type` tag, as stored in the engine config column.
    pub const AIRFLOW: &'static str = "airflow";
}

// ---------------------------------------------------------------------------
// WorkflowDag
// ---------------------------------------------------------------------------

/// An immutable snapshot of a workflow's structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDag {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub operators: Vec<OperatorDef>,
    pub artifacts: Vec<ArtifactDef>,
    pub edges: Vec<DagEdge>,
    pub storage_config: StorageConfig,
    #[serde(default)]
    pub engine_config: EngineConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WorkflowDag {
    pub fn operator(&self, id: Uuid) -> Option<&OperatorDef> {
        self.operators.iter().find(|op| op.id == id)
    }

    pub fn artifact(&self, id: Uuid) -> Option<&ArtifactDef> {
        self.artifacts.iter().find(|a| a.id == id)
    }

    pub fn airflow(&self) -> Option<&AirflowConfig> {
        match &self.engine_config {
            EngineConfig::Airflow(cfg) => Some(cfg),
            EngineConfig::Local => None,
        }
    }

    pub fn from_rows(rows: DagRows) -> Result<Self, EngineError> {
        let operators = rows
            .operators
            .into_iter()
            .map(|row| {
                Ok(OperatorDef {
                    id: row.id,
                    name: row.name,
                    description: row.description,
                    spec: serde_json::from_value(row.spec)?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let artifacts = rows
            .artifacts
            .into_iter()
            .map(|row| {
                let artifact_type = row.artifact_type.parse().map_err(|e: String| {
                    EngineError::MalformedRow(format!("artifact {}: {e}", row.id))
                })?;
                Ok(ArtifactDef {
                    id: row.id,
                    name: row.name,
                    description: row.description,
                    artifact_type,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let edges = rows
            .edges
            .into_iter()
            .map(|row| DagEdge {
                from: row.from_id,
                to: row.to_id,
                idx: u32::try_from(row.idx).unwrap_or_default(),
            })
            .collect();

        Ok(Self {
            id: rows.dag.id,
            workflow_id: rows.dag.workflow_id,
            operators,
            artifacts,
            edges,
            storage_config: serde_json::from_value(rows.dag.storage_config)?,
            engine_config: serde_json::from_value(rows.dag.engine_config)?,
            created_at: rows.dag.created_at,
        })
    }

    pub fn to_rows(&self) -> Result<DagRows, EngineError> {
        let operator_ids: HashSet<Uuid> = self.operators.iter().map(|op| op.id).collect();

        let operators = self
            .operators
            .iter()
            .map(|op| {
                Ok(OperatorRow {
                    id: op.id,
                    workflow_dag_id: self.id,
                    name: op.name.clone(),
                    description: op.description.clone(),
                    spec: serde_json::to_value(&op.spec)?,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let artifacts = self
            .artifacts
            .iter()
            .map(|a| ArtifactRow {
                id: a.id,
                workflow_dag_id: self.id,
                name: a.name.clone(),
                description: a.description.clone(),
                artifact_type: a.artifact_type.as_str().to_owned(),
            })
            .collect();

        let edges = self
            .edges
            .iter()
            .map(|e| EdgeRow {
                workflow_dag_id: self.id,
                edge_type: if operator_ids.contains(&e.from) {
                    OPERATOR_TO_ARTIFACT.to_owned()
                } else {
                    ARTIFACT_TO_OPERATOR.to_owned()
                },
                from_id: e.from,
                to_id: e.to,
                idx: i64::from(e.idx),
            })
            .collect();

        Ok(DagRows {
            dag: WorkflowDagRow {
                id: self.id,
                workflow_id: self.workflow_id,
                storage_config: serde_json::to_value(&self.storage_config)?,
                engine_config: serde_json::to_value(&self.engine_config)?,
                created_at: self.created_at,
            },
            operators,
            artifacts,
            edges,
        })
    }
}

// ---------------------------------------------------------------------------
// Artifact metadata
// ---------------------------------------------------------------------------

/// How an artifact's content blob is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationType {
    String,
    Table,
    Json,
    Bytes,
    Image,
    Pickle,
}

/// The artifact metadata blob written by a worker next to the content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Column name -> column type, one map per column.
    #[serde(default)]
    pub schema: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub system_metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<ArtifactType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization_type: Option<SerializationType>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
