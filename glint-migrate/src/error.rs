//! Error types for the migration engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Classification of a failure, independent of which store produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source or target unreachable.
    Connectivity,
    /// Schema mismatch or conflict detected before the run.
    Validation,
    /// Timeouts, lock contention and similar retryable conditions.
    Transient,
    /// Unique constraint violation on insert.
    DuplicateKey,
    /// Memory, disk or connection limits hit.
    ResourceExhaustion,
    /// External dump/restore tool failed.
    Subprocess,
    /// A source document could not be mapped to a target record.
    Transformation,
    /// Operation cancelled by the caller.
    Cancelled,
    /// Operation exceeded its deadline.
    Timeout,
    /// Bad configuration or arguments.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Stable string form, used in persisted log metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::DuplicateKey => "duplicate_key",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Subprocess => "subprocess",
            Self::Transformation => "transformation",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "connectivity" => Self::Connectivity,
            "validation" => Self::Validation,
            "transient" => Self::Transient,
            "duplicate_key" => Self::DuplicateKey,
            "resource_exhaustion" => Self::ResourceExhaustion,
            "subprocess" => Self::Subprocess,
            "transformation" => Self::Transformation,
            "cancelled" => Self::Cancelled,
            "timeout" => Self::Timeout,
            "configuration" => Self::Configuration,
            "internal" => Self::Internal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Source or target store is unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Store operation failed with a retryable condition.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Store operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Unique constraint violated.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A resource ceiling was hit.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Pre-flight validation failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Document could not be transformed.
    #[error("Transformation failed for document '{id}': {message}")]
    Transformation {
        /// Source document id.
        id: String,
        /// What went wrong.
        message: String,
    },

    /// External process failed.
    #[error("Process '{program}' failed: {message}")]
    Process {
        /// Executable name.
        program: String,
        /// Exit status and captured stderr.
        message: String,
    },

    /// Backup checksum mismatch.
    #[error("Checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Backup file.
        path: String,
        /// Checksum recorded in the sidecar.
        expected: String,
        /// Checksum of the file now.
        actual: String,
    },

    /// Checkpoint not found.
    #[error("Checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    /// A migration with the same id is already running.
    #[error("Migration '{0}' is already running")]
    AlreadyRunning(String),

    /// Lock acquisition failed.
    #[error("Failed to acquire migration lock: {0}")]
    LockFailed(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out.
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Programming error: invalid arguments.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

impl MigrationError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a duplicate key error.
    pub fn duplicate_key(msg: impl Into<String>) -> Self {
        Self::DuplicateKey(msg.into())
    }

    /// Create a resource exhaustion error.
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transformation error.
    pub fn transformation(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transformation {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a process error.
    pub fn process(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Process {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connectivity,
            Self::Transient(_) | Self::LockFailed(_) => ErrorKind::Transient,
            Self::DuplicateKey(_) => ErrorKind::DuplicateKey,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhaustion,
            Self::Validation(_) | Self::ChecksumMismatch { .. } => ErrorKind::Validation,
            Self::Transformation { .. } | Self::Json(_) => ErrorKind::Transformation,
            Self::Process { .. } => ErrorKind::Subprocess,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidArgument(_) | Self::AlreadyRunning(_) => ErrorKind::Configuration,
            Self::Io(_)
            | Self::Database(_)
            | Self::CheckpointNotFound(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the retry policy should try this operation again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::Connectivity
        )
    }

    /// Check if this is a duplicate key error.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}
