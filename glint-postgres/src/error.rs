//! Error types for PostgreSQL operations.

use std::error::Error as _;

use glint_migrate::MigrationError;
use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Unexpected query result.
    #[error("query error: {0}")]
    Query(String),

    /// Type conversion error.
    #[error("type conversion error: {0}")]
    TypeConversion(String),
}

impl PgError {
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

    /// Create a type conversion error.
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion(message.into())
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Pool(_) | Self::Connection(_) => true,
            Self::Postgres(e) => {
                e.is_closed() || e.source().is_some_and(|s| s.is::<std::io::Error>())
            }
            _ => false,
        }
    }

    /// The SQLSTATE code, if the server returned one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }
}

/// Map a SQLSTATE code onto the engine's taxonomy.
pub fn classify_sqlstate(code: &str, message: String) -> MigrationError {
    match code {
        // unique_violation
        "23505" => MigrationError::duplicate_key(message),
        // serialization_failure, deadlock_detected, lock_not_available, query_canceled
        "40001" | "40P01" | "55P03" | "57014" => MigrationError::transient(message),
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => MigrationError::connection(message),
        c if c.starts_with("08") => MigrationError::connection(message),
        c if c.starts_with("53") => MigrationError::resource_exhausted(message),
        _ => MigrationError::database(message),
    }
}

impl From<PgError> for MigrationError {
    fn from(err: PgError) -> Self {
        if let Some(code) = err.sqlstate() {
            let code = code.to_string();
            return classify_sqlstate(&code, err.to_string());
        }
        if err.is_connection_error() {
            return MigrationError::connection(err.to_string());
        }
        match err {
            PgError::Config(msg) => MigrationError::invalid_argument(msg),
            PgError::TypeConversion(msg) => MigrationError::transformation("", msg),
            other => MigrationError::database(other.to_string()),
        }
    }
}
