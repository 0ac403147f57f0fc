//! Engine error types.

use smartq_core::{JobId, JobStatus};
use smartq_storage::StorageError;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine and the job service.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Submission rejected before anything was persisted
    #[error("Invalid job: {0}")]
    Validation(String),

    /// No job with this id
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The requested command is not legal in the job's current state
    #[error("Job {id} is {status}")]
    InvalidState {
        /// Target job
        id: JobId,
        /// State observed when the command was refused
        status: JobStatus,
    },
}

/// Why one execution attempt did not succeed.
///
/// Rendered into the job's `last_error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    /// The job body reported an error
    #[error("{0}")]
    Failed(String),

    /// The deadline elapsed before the body finished
    #[error("timed out after {seconds}s")]
    Timeout {
        /// Deadline that was exceeded
        seconds: u64,
    },

    /// The body observed cancellation and stopped
    #[error("cancelled")]
    Cancelled,
}
