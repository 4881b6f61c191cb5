//! Error types for store operations

use std::fmt;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to an external store
#[derive(Debug)]
pub enum StoreError {
    /// Database connection failed
    ConnectionFailed(String),

    /// Database query failed
    QueryFailed(String),

    /// Migration failed
    MigrationFailed(String),

    /// Row (de)serialization error
    SerializationError(String),

    /// The addressed record does not exist
    NotFound(String),

    /// The store is temporarily unavailable (timeouts, injected faults)
    Unavailable(String),

    /// I/O error (file access, etc.)
    IoError(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to store: {}", msg)
            }
            StoreError::QueryFailed(msg) => write!(f, "store query failed: {}", msg),
            StoreError::MigrationFailed(msg) => write!(f, "database migration failed: {}", msg),
            StoreError::SerializationError(msg) => write!(f, "row serialization error: {}", msg),
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StoreError::IoError(io_err),
            sqlx::Error::RowNotFound => StoreError::NotFound("no rows found".to_string()),
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}
