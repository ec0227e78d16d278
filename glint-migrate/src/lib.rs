//! # glint-migrate
//!
//! Migration engine for moving a MongoDB health-data database onto PostgreSQL.
//!
//! This crate provides functionality for:
//! - Batched, memory-bounded transfer of collections into typed tables
//! - Per-collection checkpoints so an interrupted run can resume
//! - Logical backups with checksums, verification, retention and restore
//! - Rollback of a migration, optionally restoring a backup
//! - Failure analysis and strategy-based recovery
//! - Index analysis, recommendation and creation
//!
//! ## Architecture
//!
//! The engine is written against three storage traits so the same code runs
//! against live servers and against the in-memory stores used in tests.
//!
//! ```text
//! ┌────────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ DocumentSource │────▶│ Transformation │────▶│ RelationalTarget │
//! └────────────────┘     └────────────────┘     └──────────────────┘
//!         │                      │                       │
//!         ▼                      ▼                       ▼
//! ┌────────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Introspection  │     │ Checkpoints    │     │ Index Planning   │
//! └────────────────┘     └────────────────┘     └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use glint_migrate::{MigrationConfig, MigrationEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(engine: MigrationEngine) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MigrationConfig::new()
//!         .batch_size(1000)
//!         .skip_duplicates(true);
//!
//!     let result = engine.migrate(&config, &CancellationToken::new()).await?;
//!     println!("{}", result.summary());
//!
//!     if !result.is_success {
//!         // Pick up where the run stopped.
//!         engine
//!             .resume(&config, &result.migration_id, &CancellationToken::new())
//!             .await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Collections
//!
//! | Collection     | Table           |
//! |----------------|-----------------|
//! | `entries`      | `entries`       |
//! | `treatments`   | `treatments`    |
//! | `devicestatus` | `device_status` |
//! | `profile`      | `profiles`      |
//! | `food`         | `foods`         |
//! | `activity`     | `activities`    |

pub mod backup;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod index;
pub mod introspect;
pub mod memory;
pub mod process;
pub mod recovery;
pub mod retry;
pub mod rollback;
pub mod schema;
pub mod status;
pub mod store;
pub mod transform;
pub mod validation;

// Re-exports
pub use backup::{
    BackupConfig, BackupInfo, BackupMetadata, BackupResult, BackupService, BackupTools,
    BackupType, CleanupResult, RestoreResult, RetentionPolicy,
};
pub use budget::{MemoryBudget, MemoryPermit};
pub use checkpoint::{
    CheckpointData, CheckpointRepository, CheckpointStatus, LogLevel, MigrationCheckpoint,
    MigrationLock, MigrationLog, RecoveryAttempt, RollbackPoint,
};
pub use config::MigrationConfig;
pub use connection::{
    ConnectionTestOptions, ConnectionTestResult, ConnectionTestService, StoreCheck,
};
pub use engine::{
    CollectionStatistics, IndexReport, MigrationEngine, MigrationResult, MigrationStatistics,
};
pub use error::{ErrorKind, MigrateResult, MigrationError};
pub use index::{
    IndexCreationOptions, IndexCreationResult, IndexDropOptions, IndexDropResult,
    IndexOptimizationService, IndexStrategy, IndexType,
};
pub use introspect::{MongoIndexAnalysis, SchemaIntrospectionService};
pub use memory::{InMemoryCheckpointRepository, InMemorySource, InMemoryTarget};
pub use process::{ProcessCommand, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use recovery::{
    FailureAnalysis, FailureType, RecoveryConfig, RecoveryResult, RecoveryService,
    RecoveryStrategy, StrategyRegistry,
};
pub use retry::RetryPolicy;
pub use rollback::{RollbackConfig, RollbackResult, RollbackService, RollbackStep};
pub use schema::{SqlValue, TableDefinition, TargetRecord, TABLES};
pub use status::{MigrationState, MigrationStatus, StatusRegistry};
pub use store::{
    BatchRequest, BatchWriteOutcome, ConflictPolicy, DateRange, DocumentSource, IdBracket,
    RelationalTarget, ServerInfo, SourceFilter, SourcePosition,
};
pub use transform::{DataTransformationService, TransformOptions};
pub use validation::{ValidationOptions, ValidationResult, ValidationService};
