//! Per-variant job-spec construction.
//!
//! Each operator variant checks the shape of its inputs/outputs and fills
//! in its own [`JobDetails`]; everything else in the [`JobSpec`] is common.

use jobs::spec::{EntryPoint, JobDetails, JobSpec};
use storage::StorageConfig;

use crate::{
    artifact::Artifact,
    error::EngineError,
    models::{ConnectorSpec, FunctionSpec, OperatorDef, OperatorKind},
};

pub const DEFAULT_ENTRY_POINT_FILE: &str = "model.py";
pub const DEFAULT_ENTRY_POINT_CLASS: &str = "Function";
pub const DEFAULT_ENTRY_POINT_METHOD: &str = "predict";

/// Everything a job spec is built from.
pub(crate) struct SpecInputs<'a> {
    pub def: &'a OperatorDef,
    pub inputs: &'a [&'a Artifact],
    pub outputs: &'a [Artifact],
    pub job_name: &'a str,
    pub metadata_path: &'a str,
    pub storage_config: &'a StorageConfig,
}

/// Expected number of inputs or outputs.
#[derive(Clone, Copy)]
enum Arity {
    Any,
    AtLeast(usize),
    Exactly(usize),
}

impl Arity {
    fn admits(self, n: usize) -> bool {
        match self {
            Self::Any => true,
            Self::AtLeast(min) => n >= min,
            Self::Exactly(want) => n == want,
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any number of"),
            Self::AtLeast(n) => write!(f, "at least {n}"),
            Self::Exactly(n) => write!(f, "exactly {n}"),
        }
    }
}

pub(crate) fn build(args: &SpecInputs<'_>) -> Result<JobSpec, EngineError> {
    let details = match &args.def.spec.kind {
        OperatorKind::Function(f) => {
            expect_shape(args, Arity::Any, Arity::AtLeast(1))?;
            function_details(f, None)
        }
        OperatorKind::Metric(f) => {
            expect_shape(args, Arity::AtLeast(1), Arity::Exactly(1))?;
            function_details(f, None)
        }
        OperatorKind::Check(c) => {
            expect_shape(args, Arity::AtLeast(1), Arity::Exactly(1))?;
            function_details(&c.function, Some(c.level))
        }
        OperatorKind::Extract(c) => {
            // Parameters may feed an extract.
            expect_shape(args, Arity::Any, Arity::Exactly(1))?;
            let ConnectorSpec { integration_id, service, parameters } = c.clone();
            JobDetails::Extract { integration_id, connector: service, parameters }
        }
        OperatorKind::Load(c) => {
            expect_shape(args, Arity::Exactly(1), Arity::Exactly(0))?;
            let ConnectorSpec { integration_id, service, parameters } = c.clone();
            JobDetails::Load { integration_id, connector: service, parameters }
        }
        OperatorKind::Param { value } => {
            expect_shape(args, Arity::Exactly(0), Arity::Exactly(1))?;
            JobDetails::Param { value: value.clone() }
        }
        OperatorKind::SystemMetric { metric_name } => {
            expect_shape(args, Arity::Exactly(1), Arity::Exactly(1))?;
            JobDetails::SystemMetric { metric_name: metric_name.clone() }
        }
    };

    if let Some(f) = args.def.spec.kind.function() {
        if f.storage_path.is_empty() {
            return Err(invalid(args, "a serialized function path is required".into()));
        }
    }

    Ok(JobSpec {
        job_name: args.job_name.to_owned(),
        operator_type: args.def.spec.kind.operator_type(),
        storage_config: args.storage_config.clone(),
        metadata_path: args.metadata_path.to_owned(),
        input_content_paths: args.inputs.iter().map(|a| a.paths().artifact_content_path.clone()).collect(),
        input_metadata_paths: args.inputs.iter().map(|a| a.paths().artifact_metadata_path.clone()).collect(),
        output_content_paths: args.outputs.iter().map(|a| a.paths().artifact_content_path.clone()).collect(),
        output_metadata_paths: args.outputs.iter().map(|a| a.paths().artifact_metadata_path.clone()).collect(),
        input_artifact_types: args.inputs.iter().map(|a| a.artifact_type()).collect(),
        output_artifact_types: args.outputs.iter().map(Artifact::artifact_type).collect(),
        resources: args.def.spec.resources.clone(),
        details,
    })
}

fn function_details(f: &FunctionSpec, check_severity: Option<jobs::spec::CheckSeverity>) -> JobDetails {
    let entry_point = f.entry_point.clone().unwrap_or_else(|| EntryPoint {
        file: DEFAULT_ENTRY_POINT_FILE.to_owned(),
        class_name: DEFAULT_ENTRY_POINT_CLASS.to_owned(),
        method: DEFAULT_ENTRY_POINT_METHOD.to_owned(),
    });
    JobDetails::Function {
        function_path: f.storage_path.clone(),
        entry_point,
        custom_args: f.custom_args.clone(),
        check_severity,
    }
}

fn expect_shape(args: &SpecInputs<'_>, inputs: Arity, outputs: Arity) -> Result<(), EngineError> {
    if !inputs.admits(args.inputs.len()) {
        return Err(invalid(
            args,
            format!("expected {inputs} inputs, got {}", args.inputs.len()),
        ));
    }
    if !outputs.admits(args.outputs.len()) {
        return Err(invalid(
            args,
            format!("expected {outputs} outputs, got {}", args.outputs.len()),
        ));
    }
    Ok(())
}

fn invalid(args: &SpecInputs<'_>, message: String) -> EngineError {
    EngineError::InvalidOperator { operator: args.def.name.clone(), message }
}
