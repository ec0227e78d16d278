//! CLI configuration handling.

use glint_migrate::{BackupTools, MigrationConfig, RecoveryConfig, RetentionPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CliError, CliResult};

/// Default config file name (looked up in the working directory)
pub const CONFIG_FILE_NAME: &str = "glint.toml";

/// Default backup directory
pub const BACKUP_DIR: &str = "./backups";

/// Glint CLI configuration. Every section is optional; flags override it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Migration tunables
    pub migration: MigrationSection,

    /// Backoff for transient store errors
    pub retry: RetryPolicy,

    /// Backup settings
    pub backup: BackupSection,

    /// Recovery settings
    pub recovery: RecoverySection,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load an explicit file, or `glint.toml` in `cwd` when it exists, or
    /// the defaults.
    pub fn resolve(explicit: Option<&Path>, cwd: &Path) -> CliResult<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default_path = cwd.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Engine configuration seeded from this file.
    pub fn migration_config(&self) -> MigrationConfig {
        let defaults = MigrationConfig::default();
        let section = &self.migration;
        defaults
            .batch_size(section.batch_size.unwrap_or(1000))
            .max_memory_mb(section.max_memory_mb.unwrap_or(512))
            .parallelism(section.parallelism.unwrap_or(2))
            .checkpoint_interval(section.checkpoint_interval.unwrap_or(10))
            .max_concurrent_indexes(section.max_concurrent_indexes.unwrap_or(2))
            .max_skipped_documents(section.max_skipped_documents.unwrap_or(0))
            .rollback_point_interval(section.rollback_point_interval.unwrap_or(25))
            .retry(self.retry.clone())
    }

    /// Recovery configuration seeded from this file.
    pub fn recovery_config(&self, migration_id: &str) -> RecoveryConfig {
        let mut config = RecoveryConfig::new(migration_id);
        if let Some(attempts) = self.recovery.max_retry_attempts {
            config = config.max_retry_attempts(attempts);
        }
        if let Some(delay) = self.recovery.retry_delay_ms {
            config = config.retry_delay(Duration::from_millis(delay));
        }
        config.backup_directory = self.backup.directory.clone();
        config.max_data_skip_percentage = self.recovery.max_data_skip_percentage;
        config
    }
}

/// `[migration]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    /// Documents per batch
    pub batch_size: Option<usize>,

    /// Memory ceiling in megabytes
    pub max_memory_mb: Option<u64>,

    /// Collections processed concurrently
    pub parallelism: Option<usize>,

    /// Persist checkpoints every N batches
    pub checkpoint_interval: Option<usize>,

    /// Index builds running at once
    pub max_concurrent_indexes: Option<usize>,

    /// Documents allowed to fail transformation per migration
    pub max_skipped_documents: Option<u64>,

    /// Rollback point every N percent of progress (0 disables)
    pub rollback_point_interval: Option<u8>,
}

/// `[backup]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    /// Default output directory
    pub directory: PathBuf,

    /// Kill dump and restore tools after this many seconds
    pub timeout_secs: u64,

    /// Dump and restore executables
    pub tools: BackupTools,

    /// Retention applied after `glint backup`
    pub retention: RetentionPolicy,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(BACKUP_DIR),
            timeout_secs: 3600,
            tools: BackupTools::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl BackupSection {
    /// Tool timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[recovery]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Executions of a strategy before giving up
    pub max_retry_attempts: Option<u32>,

    /// Wait between executions in milliseconds
    pub retry_delay_ms: Option<u64>,

    /// Ceiling on skipped documents, percent of the remaining set
    pub max_data_skip_percentage: f64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retry_attempts: None,
            retry_delay_ms: None,
            max_data_skip_percentage: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_gives_engine_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let migration = config.migration_config();
        let defaults = MigrationConfig::default();
        assert_eq!(migration.batch_size, defaults.batch_size);
        assert_eq!(migration.max_memory_mb, defaults.max_memory_mb);
        assert_eq!(migration.checkpoint_interval, defaults.checkpoint_interval);
        assert_eq!(migration.retry, RetryPolicy::default());
        assert_eq!(config.backup.directory, PathBuf::from(BACKUP_DIR));
    }

    #[test]
    fn test_parse_sections() {
        let config: Config = toml::from_str(
            r#"
            [migration]
            batch_size = 250
            parallelism = 4

            [retry]
            initial_delay = 100
            max_attempts = 3

            [backup]
            directory = "/var/backups/glint"

            [backup.tools]
            mongodump = "/opt/mongo/bin/mongodump"

            [backup.retention]
            max_count = 5

            [recovery]
            max_retry_attempts = 2
            "#,
        )
        .unwrap();

        let migration = config.migration_config();
        assert_eq!(migration.batch_size, 250);
        assert_eq!(migration.max_degree_of_parallelism, 4);
        assert_eq!(migration.retry.initial_delay, Duration::from_millis(100));
        assert_eq!(migration.retry.max_attempts, 3);
        assert_eq!(config.backup.tools.mongodump, "/opt/mongo/bin/mongodump");
        assert_eq!(config.backup.tools.pg_dump, "pg_dump");
        assert_eq!(config.backup.retention.max_count, Some(5));

        let recovery = config.recovery_config("m1");
        assert_eq!(recovery.max_retry_attempts, 2);
        assert_eq!(recovery.backup_directory, PathBuf::from("/var/backups/glint"));
    }

    #[test]
    fn test_resolve_prefers_explicit_then_default_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::resolve(None, dir.path()).unwrap(), Config::default());

        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[migration]\nbatch_size = 10\n",
        )
        .unwrap();
        let found = Config::resolve(None, dir.path()).unwrap();
        assert_eq!(found.migration.batch_size, Some(10));

        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::resolve(Some(&missing), dir.path()),
            Err(CliError::Config(_))
        ));
    }
}
