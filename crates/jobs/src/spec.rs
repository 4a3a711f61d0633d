//! Backend-agnostic job specifications.
//!
//! A [`JobSpec`] is everything a backend worker needs to run one operator:
//! where its inputs live, where to write its outputs and its own metadata
//! blob, and the variant-specific details (entry point, connector
//! parameters, …). It is serialized as JSON when handed to a backend.

use serde::{Deserialize, Serialize};
use storage::StorageConfig;
use uuid::Uuid;

/// Declared type of the data flowing along a DAG edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Not known until the producing operator has run once.
    Untyped,
    String,
    Bool,
    Numeric,
    Dict,
    Tuple,
    List,
    Table,
    Json,
    Bytes,
    Image,
    Picklable,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untyped   => "untyped",
            Self::String    => "string",
            Self::Bool      => "bool",
            Self::Numeric   => "numeric",
            Self::Dict      => "dict",
            Self::Tuple     => "tuple",
            Self::List      => "list",
            Self::Table     => "table",
            Self::Json      => "json",
            Self::Bytes     => "bytes",
            Self::Image     => "image",
            Self::Picklable => "picklable",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| format!("unknown artifact type: {s}"))
    }
}

/// Which kind of operator a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Function,
    Metric,
    Check,
    Extract,
    Load,
    Param,
    SystemMetric,
}

/// Resource constraints requested for the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<u32>,
}

/// Where a function-style job finds its code inside the serialized bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub file: String,
    pub class_name: String,
    pub method: String,
}

/// What a failed check means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Warning,
    Error,
}

/// Variant-specific job fields. The tag doubles as the job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobDetails {
    Function {
        function_path: String,
        entry_point: EntryPoint,
        #[serde(default)]
        custom_args: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check_severity: Option<CheckSeverity>,
    },
    Extract {
        integration_id: Uuid,
        connector: String,
        parameters: serde_json::Value,
    },
    Load {
        integration_id: Uuid,
        connector: String,
        parameters: serde_json::Value,
    },
    Param {
        value: String,
    },
    SystemMetric {
        metric_name: String,
    },
}

/// A complete, backend-agnostic job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_name: String,
    pub operator_type: OperatorType,
    pub storage_config: StorageConfig,
    /// Where the worker writes the operator's execution state.
    pub metadata_path: String,
    pub input_content_paths: Vec<String>,
    pub input_metadata_paths: Vec<String>,
    pub output_content_paths: Vec<String>,
    pub output_metadata_paths: Vec<String>,
    pub input_artifact_types: Vec<ArtifactType>,
    pub output_artifact_types: Vec<ArtifactType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(flatten)]
    pub details: JobDetails,
}

impl JobSpec {
    /// The job type tag carried on the wire.
    pub fn job_type(&self) -> &'static str {
        match self.details {
            JobDetails::Function { .. }     => "function",
            JobDetails::Extract { .. }      => "extract",
            JobDetails::Load { .. }         => "load",
            JobDetails::Param { .. }        => "param",
            JobDetails::SystemMetric { .. } => "system_metric",
        }
    }
}
