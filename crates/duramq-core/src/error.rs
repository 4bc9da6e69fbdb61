//! Error kinds surfaced by the job queue.

use thiserror::Error;
use uuid::Uuid;

/// The single error type library callers match on.
///
/// Application glue that aggregates several fallible subsystems (dispatch,
/// the outer execution loop driver) generally propagates this through
/// `anyhow::Result`; code that needs to classify a failure (codec
/// verification, lock acquisition, retry policy) matches on the variant
/// directly.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Any storage operation failed. Carries the driver's own message.
    #[error("storage error: {0}")]
    Storage(String),

    /// Bad priority, bad callable shape, or a preload path that does not exist.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The callable could not be classified into a known variant.
    #[error("invalid callable: {0}")]
    InvalidCallable(String),

    /// The worker could not acquire its lock file.
    #[error("lock contention: {0}")]
    LockContention(String),

    /// HMAC verification failed on a closure payload. Always terminal.
    #[error("tampered closure payload for job {job_id}")]
    TamperedClosure { job_id: Uuid },

    /// `path_files` did not exist at execution time.
    #[error("preload path missing: {0}")]
    PreloadMissing(String),

    /// Execution exceeded the job's configured timeout.
    #[error("job {job_id} exceeded its {timeout_secs}s timeout")]
    JobTimeout { job_id: Uuid, timeout_secs: u64 },

    /// The job's callable returned or panicked with an error.
    #[error("job {job_id} failed: {message}")]
    UserError { job_id: Uuid, message: String },

    /// Dispatch could not be durably recorded.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),
}

impl QueueError {
    /// Whether this error kind should ever be retried, independent of budget.
    ///
    /// `TamperedClosure` is the only error kind that is terminal regardless
    /// of remaining retry budget.
    pub fn is_always_terminal(&self) -> bool {
        matches!(self, QueueError::TamperedClosure { .. })
    }
}
