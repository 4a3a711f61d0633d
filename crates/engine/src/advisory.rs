//! Best-effort side effects.
//!
//! Some writes (blob cleanup, artifact type promotion, cache registration,
//! artifact result rows after the operator row) must not fail the caller.
//! They go through [`advise`] so the choice to swallow an error is visible
//! at the call site and always leaves a log line.

use std::fmt::Display;

use tracing::warn;

/// Log and drop the error of an advisory operation.
pub fn advise<T, E: Display>(what: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "advisory operation failed: {what}");
            None
        }
    }
}
