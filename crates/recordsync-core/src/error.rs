//! Core error types for recordsync-core.
//!
//! Sync failures fall into four kinds that drive retry decisions:
//! transient ([`SyncError::PartiallyConnected`], [`SyncError::TransportFailure`]),
//! permanent ([`SyncError::Corrupted`]) and fatal at startup
//! ([`SyncError::SchemaValidation`]). Storage and configuration failures
//! wrap their own enums.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for recordsync-core.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A relationship target is not locally resolvable yet.
    #[error("{object_type}/{identifier}.{property} is waiting for {missing:?}")]
    PartiallyConnected {
        object_type: String,
        identifier: String,
        property: String,
        missing: Vec<String>,
    },

    /// Data no longer matches the registered schema. Never retried.
    #[error("Corrupted {object_type}/{identifier}: {reason}")]
    Corrupted {
        object_type: String,
        identifier: String,
        reason: String,
    },

    /// A push or pull against the remote store failed as a whole.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A Cloudable type violates its contract.
    #[error("Schema validation failed: {0}")]
    SchemaValidation(#[from] SchemaValidationError),

    /// Metadata database errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The local object store rejected an operation
    #[error("Local store error: {0}")]
    Store(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn corrupted(
        object_type: impl Into<String>,
        identifier: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SyncError::Corrupted {
            object_type: object_type.into(),
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::PartiallyConnected { .. }
                | SyncError::TransportFailure(_)
                | SyncError::Database(DatabaseError::Locked)
        )
    }

    /// Short label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::PartiallyConnected { .. } => "partially_connected",
            SyncError::Corrupted { .. } => "corrupted",
            SyncError::TransportFailure(_) => "transport_failure",
            SyncError::SchemaValidation(_) => "schema_validation",
            SyncError::Database(_) => "database",
            SyncError::Config(_) => "config",
            SyncError::Store(_) => "store",
            SyncError::Io(_) => "io",
            SyncError::Json(_) => "json",
        }
    }
}

/// Violations of the Cloudable contract, detected when the schema registry is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaValidationError {
    #[error("{record_type}: primary key '{key}' is not a declared property")]
    MissingPrimaryKey { record_type: String, key: String },

    #[error("{record_type}: primary key '{key}' must be a required string")]
    PrimaryKeyNotString { record_type: String, key: String },

    #[error("{record_type}: primary key '{key}' cannot be excluded from sync")]
    PrimaryKeyNotSynced { record_type: String, key: String },

    #[error("{record_type}.{property}: target type '{target}' is not registered")]
    UnknownTarget {
        record_type: String,
        property: String,
        target: String,
    },

    #[error("{record_type}: property '{property}' declared twice")]
    DuplicateProperty { record_type: String, property: String },

    #[error("record type '{0}' registered twice")]
    DuplicateType(String),

    #[error("type tag '{tag}' does not match declared record type '{declared}'")]
    RecordTypeMismatch { tag: String, declared: String },

    #[error("record type must not be empty")]
    EmptyRecordType,
}

/// Metadata database errors.
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

    /// Database is locked
    #[error("Database is locked")]
    Locked,
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
    MissingKey(String),

    /// Data directory could not be resolved or created
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked
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

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Database(DatabaseError::from(err))
    }
}

/// Result type alias for SyncError
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
