//! Error types for object store operations.

use std::io;
use thiserror::Error;

/// Result type for object store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested object does not exist.
    #[error("object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket that was searched.
        bucket: String,
        /// Key that was not found.
        key: String,
    },

    /// The bucket or key is not acceptable to the store.
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// The remote backend rejected or failed the request.
    #[error("backend error: {message}")]
    Backend {
        /// Error message reported by the backend.
        message: String,
        /// Whether repeating the request may succeed.
        retryable: bool,
    },
}

impl StoreError {
    /// Creates a not found error.
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Creates an invalid key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey(message.into())
    }

    /// Creates a retryable backend error.
    pub fn backend_retryable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable backend error.
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed operation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Backend { retryable, .. } => *retryable,
            StoreError::Io(_) => true,
            StoreError::NotFound { .. } | StoreError::InvalidKey(_) => false,
        }
    }
}
