//! Error types for PolyKV operations.
//!
//! This module defines the closed set of failure kinds the storage facade
//! may surface (see the error taxonomy in the design docs). All public APIs
//! return [`StorageResult<T>`], an alias for `Result<T, StorageError>`.
//!
//! Driver-specific errors from individual backends (sled, redis,
//! tokio-postgres, ...) are converted into one of the closed variants below;
//! none of those native error types ever cross the [`crate::Storage`]
//! boundary.

use thiserror::Error;

/// Result type alias for PolyKV operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The closed set of failures a [`crate::Storage`] operation may surface.
///
/// `NotFound` is deliberately absent: a missing key is represented as
/// `None` in `get`'s result, never as an `Err`.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Invalid namespace/table identifier, or a missing required
    /// configuration key.
    #[error("bad config: {0}")]
    BadConfig(String),

    /// A key's arity or field types don't match the table's key spec.
    #[error("bad key: {0}")]
    BadKey(String),

    /// Operation referenced a table that was never declared via
    /// `setup_namespace`.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A value exceeded the backend's size ceiling.
    #[error("value too large: {size} bytes exceeds limit of {limit} bytes")]
    ValueTooLarge { size: usize, limit: usize },

    /// The backend could not be reached. The caller may retry; the facade
    /// does not retry internally.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The backend returned a fatal, non-connectivity error. The
    /// connection has already been detached by the time this is returned.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The client was already closed; this is terminal for the instance.
    #[error("client is closed")]
    ClosedClient,
}

impl StorageError {
    pub(crate) fn bad_config(msg: impl Into<String>) -> Self {
        StorageError::BadConfig(msg.into())
    }

    pub(crate) fn bad_key(msg: impl Into<String>) -> Self {
        StorageError::BadKey(msg.into())
    }

    pub(crate) fn backend(msg: impl Into<String>) -> Self {
        StorageError::BackendError(msg.into())
    }

    pub(crate) fn connectivity(msg: impl Into<String>) -> Self {
        StorageError::Connectivity(msg.into())
    }
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Io(io) => StorageError::Connectivity(io.to_string()),
            other => StorageError::BackendError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Connectivity(e.to_string())
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StorageError::Connectivity(e.to_string())
        } else {
            StorageError::BackendError(e.to_string())
        }
    }
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.is_closed() {
            StorageError::Connectivity(e.to_string())
        } else {
            StorageError::BackendError(e.to_string())
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            StorageError::Connectivity(e.to_string())
        } else {
            StorageError::BackendError(e.to_string())
        }
    }
}
