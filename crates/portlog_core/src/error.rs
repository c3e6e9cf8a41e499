//! Error types for portlog core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the capture and consolidation pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error on a local segment file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Object store error.
    #[error("store error: {0}")]
    Store(#[from] portlog_store::StoreError),

    /// Stream identifier cannot be used in segment file names.
    #[error("invalid stream id '{id}': {reason}")]
    InvalidStreamId {
        /// The rejected identifier.
        id: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Configuration value is missing or malformed.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The transport for a stream could not be opened.
    #[error("stream {stream}: cannot open transport '{identifier}': {source}")]
    TransportOpen {
        /// Stream the transport belongs to.
        stream: String,
        /// Transport identifier, e.g. a device path.
        identifier: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The transport returned a non-timeout read error.
    #[error("stream {stream}: transport read failed: {source}")]
    TransportRead {
        /// Stream the transport belongs to.
        stream: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The storage root could not be created or is not a directory.
    #[error("storage root {}: {source}", path.display())]
    StorageRoot {
        /// Configured storage root.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The storage root is locked by another process.
    #[error("storage root {} is in use by another process", path.display())]
    StorageLocked {
        /// Configured storage root.
        path: PathBuf,
    },
}

impl CoreError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a transport open error.
    pub fn transport_open(
        stream: impl Into<String>,
        identifier: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self::TransportOpen {
            stream: stream.into(),
            identifier: identifier.into(),
            source,
        }
    }

    /// Creates a transport read error.
    pub fn transport_read(stream: impl Into<String>, source: io::Error) -> Self {
        Self::TransportRead {
            stream: stream.into(),
            source,
        }
    }

    /// Returns true if this error terminates a single stream's capture loop.
    ///
    /// Such errors never affect other streams or the consolidator.
    pub fn is_fatal_for_stream(&self) -> bool {
        matches!(
            self,
            CoreError::TransportOpen { .. } | CoreError::TransportRead { .. }
        )
    }
}
