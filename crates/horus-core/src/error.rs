//! Core error types for horus-core.
//!
//! This module defines the error hierarchy using thiserror. Steady-state
//! sync failures are not surfaced through these types; they are collected as
//! strings in `SyncResult::errors`. Only setup failures reach the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for horus-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device communication errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The requested device record does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked (retry budget exhausted)
    #[error("Database is locked")]
    Locked,

    /// Savepoint names are spliced into SQL and must be plain identifiers
    #[error("Invalid savepoint name: {0}")]
    InvalidSavepoint(String),
}

impl DatabaseError {
    /// Whether the error is transient lock contention.
    pub fn is_locked(&self) -> bool {
        matches!(self, DatabaseError::Locked)
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Home/data directory could not be prepared
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Device communication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid device configuration: {0}")]
    InvalidConfig(String),

    #[error("Not connected")]
    NotConnected,
}

impl DeviceError {
    /// Transient failures worth another attempt. Authentication and
    /// configuration problems will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::Connect(_)
                | DeviceError::Timeout(_)
                | DeviceError::Protocol(_)
                | DeviceError::NotConnected
        )
    }

    /// Message suitable for showing to an operator.
    pub fn user_message(&self) -> String {
        match self {
            DeviceError::Timeout(_) => {
                "Connection timeout - device may be unreachable or IP/port incorrect".to_string()
            }
            DeviceError::Auth(_) => "Authentication failed - check communication key".to_string(),
            DeviceError::Connect(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("refused") {
                    "Connection refused - check if device is powered on and network accessible"
                        .to_string()
                } else if lower.contains("unreachable") {
                    "Host unreachable - check network configuration".to_string()
                } else {
                    self.to_string()
                }
            }
            other => other.to_string(),
        }
    }
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid date range
    #[error("Invalid date range: end ({end}) is before start ({start})")]
    InvalidDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(inner, _msg) => {
                if inner.code == rusqlite::ErrorCode::DatabaseLocked
                    || inner.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_locked_map_to_locked() {
        for code in [rusqlite::ffi::SQLITE_BUSY, rusqlite::ffi::SQLITE_LOCKED] {
            let err = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None);
            assert!(DatabaseError::from(err).is_locked());
        }
    }

    #[test]
    fn constraint_failure_is_not_locked() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed".into()),
        );
        let mapped = DatabaseError::from(err);
        assert!(!mapped.is_locked());
        assert!(mapped.to_string().contains("Query failed"));
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        assert!(!DeviceError::Auth("denied".into()).is_retryable());
        assert!(!DeviceError::InvalidConfig("bad ip".into()).is_retryable());
        assert!(DeviceError::Timeout("read".into()).is_retryable());
        assert!(DeviceError::Connect("refused".into()).is_retryable());
    }

    #[test]
    fn user_message_explains_refused_connection() {
        let msg = DeviceError::Connect("connection refused (os error 111)".into()).user_message();
        assert!(msg.starts_with("Connection refused"));
    }
}
