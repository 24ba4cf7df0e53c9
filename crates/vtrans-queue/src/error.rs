//! Queue error types.

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Version conflict on job {0}")]
    VersionConflict(String),

    #[error("Job {0} is in a terminal state")]
    TerminalState(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn conflict(job_id: impl ToString) -> Self {
        Self::VersionConflict(job_id.to_string())
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }

    /// True if a compare-and-swap lost against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, QueueError::VersionConflict(_))
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) | QueueError::PublishFailed(_) => true,
            QueueError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}
