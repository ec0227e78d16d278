//! CLI error types and result alias.

use glint_migrate::{ErrorKind, MigrationError};
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    #[diagnostic(code(glint::io))]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(glint::config),
        help("check the flags, the GLINT_* environment variables and glint.toml")
    )]
    Config(String),

    /// A store could not be reached
    #[error("Connection error: {0}")]
    #[diagnostic(
        code(glint::connection),
        help("run `glint test-connections --verbose` to diagnose")
    )]
    Connection(String),

    /// Pre-flight validation failed
    #[error("Validation error: {0}")]
    #[diagnostic(code(glint::validation))]
    Validation(String),

    /// Migration error
    #[error("Migration error: {0}")]
    #[diagnostic(code(glint::migration))]
    Migration(String),

    /// Backup error
    #[error("Backup error: {0}")]
    #[diagnostic(code(glint::backup))]
    Backup(String),

    /// Rollback error
    #[error("Rollback error: {0}")]
    #[diagnostic(code(glint::rollback))]
    Rollback(String),

    /// Recovery error
    #[error("Recovery error: {0}")]
    #[diagnostic(code(glint::recovery))]
    Recovery(String),

    /// Interrupted by Ctrl-C
    #[error("Cancelled")]
    #[diagnostic(code(glint::cancelled))]
    Cancelled,

    /// Deadline exceeded
    #[error("Timed out: {0}")]
    #[diagnostic(code(glint::timeout))]
    Timeout(String),
}

impl CliError {
    /// Process exit code for this error: 2 for cancellation and timeouts,
    /// 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Cancelled | CliError::Timeout(_) => 2,
            _ => 1,
        }
    }
}

impl From<MigrationError> for CliError {
    fn from(err: MigrationError) -> Self {
        match err.kind() {
            ErrorKind::Cancelled => CliError::Cancelled,
            ErrorKind::Timeout => CliError::Timeout(err.to_string()),
            ErrorKind::Connectivity => CliError::Connection(err.to_string()),
            ErrorKind::Configuration => CliError::Config(err.to_string()),
            ErrorKind::Validation => CliError::Validation(err.to_string()),
            _ => CliError::Migration(err.to_string()),
        }
    }
}

impl From<glint_mongodb::MongoError> for CliError {
    fn from(err: glint_mongodb::MongoError) -> Self {
        MigrationError::from(err).into()
    }
}

impl From<glint_postgres::PgError> for CliError {
    fn from(err: glint_postgres::PgError) -> Self {
        MigrationError::from(err).into()
    }
}

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(format!("Failed to parse TOML: {}", err))
    }
}
