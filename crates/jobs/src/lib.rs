//! `jobs` crate: the `JobManager` contract and its job specifications.
//!
//! Every compute backend (local processes, container orchestrators,
//! serverless functions, managed Spark) is driven through [`JobManager`].
//! The engine crate dispatches operator execution through this trait object
//! and never talks to a backend client directly.

pub mod batch;
pub mod error;
pub mod mock;
pub mod process;
pub mod spec;
pub mod traits;

pub use error::JobError;
pub use spec::{ArtifactType, JobDetails, JobSpec, OperatorType};
pub use traits::{JobManager, JobStatus};
