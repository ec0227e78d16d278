//! Error types for MongoDB operations.

use glint_migrate::MigrationError;
use thiserror::Error;

/// Result type for MongoDB operations.
pub type MongoResult<T> = Result<T, MongoError>;

/// Server error code for a unique index violation.
pub const DUPLICATE_KEY: i32 = 11000;

/// Server error codes worth retrying: exceeded time limit, lock timeout,
/// write conflict, host unreachable, host not found, network timeout,
/// interrupted at shutdown, not primary and node recovering.
const TRANSIENT_CODES: &[i32] = &[50, 24, 112, 6, 7, 89, 91, 189, 10107, 11600, 11602, 13435, 13436];

/// Errors that can occur during MongoDB operations.
#[derive(Error, Debug)]
pub enum MongoError {
    /// MongoDB driver error.
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// BSON deserialization error.
    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Unexpected server reply.
    #[error("query error: {0}")]
    Query(String),
}

impl MongoError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Driver(e) => is_network_failure(e),
            _ => false,
        }
    }

    /// The server error code, if the server returned one.
    pub fn server_code(&self) -> Option<i32> {
        use mongodb::error::{ErrorKind, WriteFailure};

        let Self::Driver(e) = self else {
            return None;
        };
        match e.kind.as_ref() {
            ErrorKind::Command(c) => Some(c.code),
            ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(w)) => Some(w.code),
            _ => None,
        }
    }
}

fn is_network_failure(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    matches!(
        e.kind.as_ref(),
        ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Authentication { .. }
    )
}

/// Map a server error code onto the engine's taxonomy.
pub fn classify_code(code: i32, message: String) -> MigrationError {
    if code == DUPLICATE_KEY {
        MigrationError::duplicate_key(message)
    } else if TRANSIENT_CODES.contains(&code) {
        MigrationError::transient(message)
    } else {
        MigrationError::database(message)
    }
}

impl From<MongoError> for MigrationError {
    fn from(err: MongoError) -> Self {
        if err.is_connection_error() {
            return MigrationError::connection(err.to_string());
        }
        if let Some(code) = err.server_code() {
            return classify_code(code, err.to_string());
        }
        match err {
            MongoError::Driver(e) => {
                let msg = e.to_string();
                if msg.contains("E11000") {
                    MigrationError::duplicate_key(msg)
                } else {
                    MigrationError::database(msg)
                }
            }
            MongoError::BsonDe(e) => MigrationError::other(e.to_string()),
            MongoError::Config(msg) => MigrationError::invalid_argument(msg),
            MongoError::Connection(msg) => MigrationError::connection(msg),
            MongoError::Query(msg) => MigrationError::database(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_migrate::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = MongoError::config("test error");
        assert_eq!(err.to_string(), "configuration error: test error");
        assert!(MongoError::connection("refused").is_connection_error());
    }

    #[test]
    fn test_classify_code() {
        assert_eq!(
            classify_code(11000, "E11000 duplicate key".into()).kind(),
            ErrorKind::DuplicateKey
        );
        assert_eq!(classify_code(112, "write conflict".into()).kind(), ErrorKind::Transient);
        assert_eq!(classify_code(50, "time limit".into()).kind(), ErrorKind::Transient);
        assert_eq!(classify_code(2, "bad value".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_into_migration_error() {
        let err: MigrationError = MongoError::connection("refused").into();
        assert_eq!(err.kind(), ErrorKind::Connectivity);

        let err: MigrationError = MongoError::config("bad uri").into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
