//! Blob store errors.

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage misconfigured: {0}")]
    Config(String),

    #[error("No object at {0}")]
    NotFound(String),

    #[error("Writing {key} failed: {reason}")]
    Upload { key: String, reason: String },

    #[error("Reading {key} failed: {reason}")]
    Download { key: String, reason: String },

    #[error("Presigning {key} failed: {reason}")]
    Presign { key: String, reason: String },

    /// Bucket-level failure not tied to one object
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn upload_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Upload {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn download_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Download {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn presign_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Presign {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Object key the error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::NotFound(key)
            | Self::Upload { key, .. }
            | Self::Download { key, .. }
            | Self::Presign { key, .. } => Some(key),
            _ => None,
        }
    }
}
