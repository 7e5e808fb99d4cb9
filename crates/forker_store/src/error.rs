//! Error types for the durable store.

use forker_protocol::{JobId, TargetId};
use thiserror::Error;

/// Store error type. Every disk or database failure surfaces here; callers
/// fail the enclosing operation and let recovery retry.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Target not found: {job_id}/{target_id}")]
    TargetNotFound { job_id: JobId, target_id: TargetId },

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// The row advanced past the caller's expected version; a concurrent
    /// transition won. Callers re-read and retry a bounded number of times.
    #[error("Version conflict on {entity}: expected version {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: i64,
        found: i64,
    },

    #[error("Invalid status for operation: {0}")]
    InvalidStatus(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
