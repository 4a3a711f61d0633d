//! Deterministic storage paths for one run.
//!
//! Every path is derived from the run id and node ids alone, so a restarted
//! orchestrator finds the blobs written by workers it never talked to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where one artifact's blobs, and its producer's metadata blob, live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecPaths {
    pub artifact_content_path: String,
    pub artifact_metadata_path: String,
    pub op_metadata_path: String,
}

impl ExecPaths {
    /// Paths of artifact `artifact_id`, produced by `producer_id`, in run `run_id`.
    pub fn for_run(run_id: Uuid, artifact_id: Uuid, producer_id: Uuid) -> Self {
        Self {
            artifact_content_path: format!("runs/{run_id}/artifacts/{artifact_id}/content"),
            artifact_metadata_path: format!("runs/{run_id}/artifacts/{artifact_id}/metadata"),
            op_metadata_path: operator_metadata_path(run_id, producer_id),
        }
    }

    /// Paths recorded for a run imported from an external engine. Nothing is
    /// written there by this system; the paths only have to be unique.
    pub fn for_external_run(remote_run_id: &str, artifact_id: Uuid, producer_id: Uuid) -> Self {
        let run = sanitize(remote_run_id);
        Self {
            artifact_content_path: format!("external/{run}/artifacts/{artifact_id}/content"),
            artifact_metadata_path: format!("external/{run}/artifacts/{artifact_id}/metadata"),
            op_metadata_path: format!("external/{run}/operators/{producer_id}/metadata"),
        }
    }
}

/// The blob an operator's worker writes its [`ExecutionState`](crate::ExecutionState) to.
pub fn operator_metadata_path(run_id: Uuid, operator_id: Uuid) -> String {
    format!("runs/{run_id}/operators/{operator_id}/metadata")
}

/// Run-owned copy of an operator's serialized function, staged for previews
/// so that cleanup never touches the registered blob.
pub fn operator_function_path(run_id: Uuid, operator_id: Uuid) -> String {
    format!("runs/{run_id}/operators/{operator_id}/function")
}

/// Job names are unique per (run, operator).
pub fn job_name(run_id: Uuid, operator_id: Uuid) -> String {
    format!("{run_id}-{operator_id}")
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_metadata_path_is_shared_by_all_outputs() {
        let run = Uuid::new_v4();
        let op = Uuid::new_v4();
        let a = ExecPaths::for_run(run, Uuid::new_v4(), op);
        let b = ExecPaths::for_run(run, Uuid::new_v4(), op);

        assert_eq!(a.op_metadata_path, b.op_metadata_path);
        assert_ne!(a.artifact_content_path, b.artifact_content_path);
        assert_eq!(a.op_metadata_path, operator_metadata_path(run, op));
    }

    #[test]
    fn external_run_ids_are_made_path_safe() {
        let paths = ExecPaths::for_external_run(
            "scheduled__2024-01-01T00:00:00+00:00",
            Uuid::nil(),
            Uuid::nil(),
        );
        assert!(paths.artifact_content_path.starts_with("external/scheduled__2024-01-01T00_00_00_00_00/"));
    }
}
