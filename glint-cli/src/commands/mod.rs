//! CLI command implementations.

pub mod backup;
pub mod migrate;
pub mod recovery;
pub mod rollback;
pub mod test_connections;

use std::sync::Arc;

use glint_migrate::{
    BackupService, ErrorKind, MigrationEngine, StatusRegistry, TokioProcessRunner,
};
use glint_mongodb::{MongoClient, MongoConfig, MongoSource};
use glint_postgres::{PgCheckpointRepository, PgConfig, PgPool, PgTarget, PoolConfig};

use crate::cli::MongoArgs;
use crate::config::Config;
use crate::error::CliResult;

/// How a command ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exit code 0.
    Success,
    /// Exit code 1.
    Failure,
    /// Exit code 2: cancelled or timed out.
    Interrupted,
}

impl Outcome {
    /// Outcome of an operation that reports `is_success` and an error kind.
    pub fn from_result(is_success: bool, error_kind: Option<ErrorKind>) -> Self {
        match (is_success, error_kind) {
            (true, _) => Outcome::Success,
            (false, Some(ErrorKind::Cancelled | ErrorKind::Timeout)) => Outcome::Interrupted,
            (false, _) => Outcome::Failure,
        }
    }

    /// Process exit code.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure => 1,
            Outcome::Interrupted => 2,
        }
    }
}

/// Connect to the document store. The driver connects lazily.
pub async fn connect_source(args: &MongoArgs) -> CliResult<Arc<MongoSource>> {
    let config = MongoConfig::from_uri(&args.mongo_connection, &args.mongo_database);
    let client = MongoClient::new(config).await?;
    Ok(Arc::new(MongoSource::new(client)))
}

/// Build a pool for the relational store, sized for `parallelism`
/// collections and `concurrent_indexes` index builds.
pub fn connect_pool(url: &str, parallelism: usize, concurrent_indexes: usize) -> CliResult<PgPool> {
    let config = PgConfig::from_url(url)?;
    let pool = PgPool::with_pool_config(
        config,
        PoolConfig::for_parallelism(parallelism, concurrent_indexes),
    )?;
    Ok(pool)
}

/// Backup service running the configured dump and restore tools.
pub fn backup_service(config: &Config) -> BackupService {
    BackupService::new(Arc::new(TokioProcessRunner)).with_tools(config.backup.tools.clone())
}

/// Engine over MongoDB, PostgreSQL and the PostgreSQL checkpoint store.
pub fn engine(
    source: Arc<MongoSource>,
    pool: &PgPool,
    registry: Arc<StatusRegistry>,
) -> MigrationEngine {
    MigrationEngine::new(
        source,
        Arc::new(PgTarget::new(pool.clone())),
        Arc::new(PgCheckpointRepository::new(pool.clone())),
    )
    .with_registry(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(Outcome::from_result(true, None).exit_code(), 0);
        assert_eq!(
            Outcome::from_result(false, Some(ErrorKind::Connectivity)).exit_code(),
            1
        );
        assert_eq!(
            Outcome::from_result(false, Some(ErrorKind::Cancelled)).exit_code(),
            2
        );
        assert_eq!(
            Outcome::from_result(false, Some(ErrorKind::Timeout)).exit_code(),
            2
        );
        assert_eq!(Outcome::from_result(false, None).exit_code(), 1);
    }
}
