use super::models::JobStatus;
use thiserror::Error;

/// Errors surfaced by dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job is not running: {0}")]
    NotRunning(String),

    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for DispatchError {
    fn from(err: rusqlite::Error) -> Self {
        DispatchError::StorageUnavailable(err.into())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::StorageUnavailable(err.into())
    }
}

impl DispatchError {
    /// Transient errors are worth retrying with backoff; everything else is a
    /// caller mistake or stale client state.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::StorageUnavailable(_))
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::NotRunning(_) => "not_running",
            DispatchError::DuplicateId(_) => "duplicate_id",
            DispatchError::ValidationFailed(_) => "validation_failed",
            DispatchError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
