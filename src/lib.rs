//! # Glint
//!
//! Resumable migration of a MongoDB health-data database onto PostgreSQL.
//!
//! Glint provides:
//! - Batched, memory-bounded transfer of collections into typed tables
//! - Checkpoints so an interrupted run resumes where it stopped
//! - Checksummed backups with verification, retention and restore
//! - Rollback and failure recovery
//! - Index recommendations derived from the source indexes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use glint::prelude::*;
//! use glint::mongodb::{MongoClient, MongoConfig, MongoSource};
//! use glint::postgres::{PgCheckpointRepository, PgPool, PgTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MongoClient::new(MongoConfig::from_uri("mongodb://localhost", "care")).await?;
//!     let pool = PgPool::from_url("postgresql://localhost/care")?;
//!
//!     let engine = MigrationEngine::new(
//!         Arc::new(MongoSource::new(client)),
//!         Arc::new(PgTarget::new(pool.clone())),
//!         Arc::new(PgCheckpointRepository::new(pool)),
//!     );
//!
//!     let config = MigrationConfig::new().batch_size(1000).skip_duplicates(true);
//!     let result = engine.migrate(&config, &CancellationToken::new()).await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Migration engine, backups, rollback and recovery.
pub mod migrate {
    pub use glint_migrate::*;
}

/// MongoDB document source.
#[cfg(feature = "mongodb")]
#[cfg_attr(docsrs, doc(cfg(feature = "mongodb")))]
pub mod mongodb {
    pub use glint_mongodb::*;
}

/// PostgreSQL target and checkpoint store.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use glint_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::migrate::{
        BackupConfig, BackupService, MigrationConfig, MigrationEngine, MigrationResult,
        RecoveryConfig, RecoveryService, RetryPolicy, RollbackConfig, RollbackService,
    };
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at the crate root
pub use migrate::{ErrorKind, MigrateResult, MigrationError};
