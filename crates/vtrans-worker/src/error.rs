//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The job's lease passed to another owner; local work must stop.
    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    #[error("Invalid upload notification: {0}")]
    InvalidUpload(String),

    #[error("Invalid media playlist: {0}")]
    InvalidPlaylist(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Gave up on job {0} after repeated write conflicts")]
    ConflictRetriesExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Model error: {0}")]
    Model(#[from] vtrans_models::ModelError),

    #[error("Queue error: {0}")]
    Queue(#[from] vtrans_queue::QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] vtrans_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] vtrans_media::MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn lease_lost(job_id: impl ToString) -> Self {
        Self::LeaseLost(job_id.to_string())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, WorkerError::LeaseLost(_))
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Queue(e) => e.is_retryable() || e.is_conflict(),
            WorkerError::Storage(_) | WorkerError::Io(_) | WorkerError::ConflictRetriesExhausted(_) => {
                true
            }
            WorkerError::Media(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(WorkerError::lease_lost("j1").is_lease_lost());
        assert!(!WorkerError::lease_lost("j1").is_retryable());
        assert!(WorkerError::from(vtrans_queue::QueueError::conflict("j1")).is_retryable());
        assert!(!WorkerError::InvalidUpload("empty".into()).is_retryable());
    }
}
