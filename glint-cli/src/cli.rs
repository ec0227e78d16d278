//! CLI argument definitions using clap.

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Glint - MongoDB to PostgreSQL migration and recovery
#[derive(Parser, Debug)]
#[command(name = "glint")]
#[command(version)]
#[command(about = "Glint - MongoDB to PostgreSQL migration and recovery", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a glint.toml with tunables (defaults to ./glint.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging and detailed output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate collections from MongoDB into PostgreSQL
    Migrate(MigrateArgs),

    /// Undo a migration: drop tables, delete checkpoints, restore a backup
    Rollback(RollbackArgs),

    /// Create a MongoDB backup with mongodump
    Backup(BackupArgs),

    /// Analyze a failed migration and run a recovery strategy
    Recovery(RecoveryArgs),

    /// Check that the configured stores are reachable
    TestConnections(TestConnectionsArgs),
}

/// Format of log lines written to stderr
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Parse `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{}' is not a date (YYYY-MM-DD) or RFC 3339 timestamp", value))
}

// =============================================================================
// Connections
// =============================================================================

/// Source store connection
#[derive(Args, Debug, Clone)]
pub struct MongoArgs {
    /// MongoDB connection string
    #[arg(long, env = "GLINT_MONGO_CONNECTION")]
    pub mongo_connection: String,

    /// MongoDB database name
    #[arg(long, env = "GLINT_MONGO_DATABASE")]
    pub mongo_database: String,
}

// =============================================================================
// Migrate Command
// =============================================================================

/// Arguments for the `migrate` command
#[derive(Args, Debug)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub mongo: MongoArgs,

    /// PostgreSQL connection URL
    #[arg(long, env = "GLINT_POSTGRES_CONNECTION")]
    pub postgres_connection: String,

    /// Collections to migrate (all mapped collections when omitted)
    #[arg(long, value_delimiter = ',')]
    pub collections: Vec<String>,

    /// Documents per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Memory ceiling in megabytes
    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    /// Collections processed concurrently
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Drop and recreate target tables first
    #[arg(long)]
    pub drop_tables: bool,

    /// Skip rows that already exist instead of failing
    #[arg(long)]
    pub skip_duplicates: bool,

    /// Only migrate documents dated on or after this day
    #[arg(long, value_parser = parse_date)]
    pub start_date: Option<DateTime<Utc>>,

    /// Only migrate documents dated on or before this day
    #[arg(long, value_parser = parse_date)]
    pub end_date: Option<DateTime<Utc>>,

    /// Do not compute or create indexes after the run
    #[arg(long)]
    pub skip_index_creation: bool,

    /// Print recommended indexes instead of creating them
    #[arg(long)]
    pub defer_index_creation: bool,

    /// Drop existing non-primary indexes on migrated tables first
    #[arg(long)]
    pub drop_existing_indexes: bool,

    /// Index builds running at once
    #[arg(long)]
    pub max_concurrent_indexes: Option<usize>,

    /// Keep null-valued unmapped fields in additional_properties
    #[arg(long)]
    pub preserve_null_properties: bool,

    /// Skip the connection check before starting
    #[arg(long)]
    pub skip_connection_test: bool,

    /// Skip schema and data validation before starting
    #[arg(long)]
    pub skip_validation: bool,

    /// Identity of the run (generated when omitted)
    #[arg(long)]
    pub migration_id: Option<String>,

    /// Resume from a checkpoint id or migration id
    #[arg(long, value_name = "CHECKPOINT_ID", conflicts_with = "drop_tables")]
    pub resume: Option<String>,
}

// =============================================================================
// Rollback Command
// =============================================================================

/// Arguments for the `rollback` command
#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Migration to roll back
    #[arg(long)]
    pub migration_id: String,

    /// PostgreSQL connection URL
    #[arg(long, env = "GLINT_POSTGRES_CONNECTION")]
    pub postgres_connection: String,

    /// Backup file to restore
    #[arg(long)]
    pub backup_file: Option<PathBuf>,

    /// Rollback point whose backup should be restored
    #[arg(long, conflicts_with = "backup_file")]
    pub rollback_point: Option<String>,

    /// MongoDB connection string, for restoring MongoDB data
    #[arg(long, env = "GLINT_MONGO_CONNECTION")]
    pub mongo_connection: Option<String>,

    /// MongoDB database name, for restoring MongoDB data
    #[arg(long, env = "GLINT_MONGO_DATABASE")]
    pub mongo_database: Option<String>,

    /// Drop the tables the migration wrote to
    #[arg(long)]
    pub drop_tables: bool,

    /// Restore MongoDB data from the backup
    #[arg(long)]
    pub restore_mongo_data: bool,

    /// Show the planned operations without executing them
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub skip_confirmation: bool,
}

// =============================================================================
// Backup Command
// =============================================================================

/// Arguments for the `backup` command
#[derive(Args, Debug)]
pub struct BackupArgs {
    #[command(flatten)]
    pub mongo: MongoArgs,

    /// Directory receiving the backup (defaults to the configured directory)
    #[arg(short, long)]
    pub output_directory: Option<PathBuf>,

    /// File name of the backup (generated when omitted)
    #[arg(long)]
    pub backup_filename: Option<String>,

    /// Collections to include (all when omitted)
    #[arg(long, value_delimiter = ',')]
    pub collections: Vec<String>,

    /// Gzip the archive
    #[arg(long)]
    pub compress: bool,

    /// Verify the backup after writing it
    #[arg(long)]
    pub verify: bool,

    /// Keep only the newest N backups in the directory afterwards
    #[arg(long, value_name = "N")]
    pub retain: Option<usize>,
}

// =============================================================================
// Recovery Command
// =============================================================================

/// Arguments for the `recovery` command
#[derive(Args, Debug)]
pub struct RecoveryArgs {
    /// Migration to recover
    #[arg(long)]
    pub migration_id: String,

    #[command(flatten)]
    pub mongo: MongoArgs,

    /// PostgreSQL connection URL
    #[arg(long, env = "GLINT_POSTGRES_CONNECTION")]
    pub postgres_connection: String,

    /// Strategy to run instead of the best-ranked one
    #[arg(long)]
    pub recovery_strategy: Option<String>,

    /// Executions of the strategy before giving up
    #[arg(long)]
    pub max_retry_attempts: Option<u32>,

    /// Back up PostgreSQL before recovering
    #[arg(long)]
    pub create_backup: bool,

    /// Backup restored by the restore-from-backup-then-retry strategy
    #[arg(long)]
    pub backup_file: Option<PathBuf>,

    /// Skip documents that fail transformation, within the configured budget
    #[arg(long)]
    pub skip_problematic_data: bool,

    /// Print the failure analysis without recovering
    #[arg(long)]
    pub analyze_only: bool,
}

// =============================================================================
// Test Connections Command
// =============================================================================

/// Arguments for the `test-connections` command
#[derive(Args, Debug)]
pub struct TestConnectionsArgs {
    /// MongoDB connection string
    #[arg(long, env = "GLINT_MONGO_CONNECTION")]
    pub mongo_connection: Option<String>,

    /// MongoDB database name
    #[arg(long, env = "GLINT_MONGO_DATABASE")]
    pub mongo_database: Option<String>,

    /// PostgreSQL connection URL
    #[arg(long, env = "GLINT_POSTGRES_CONNECTION")]
    pub postgres_connection: Option<String>,

    /// Seconds to wait for each store
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}
