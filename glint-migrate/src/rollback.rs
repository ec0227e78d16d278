//! Rollback of a migration.
//!
//! A rollback is an ordered list of operations: drop the tables the
//! migration created (reverse creation order), delete its checkpoints, and
//! optionally restore a backup. Every operation reports its own outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupService, BackupType, read_sidecar};
use crate::checkpoint::{CheckpointRepository, MigrationLog, RollbackPoint};
use crate::error::{MigrateResult, MigrationError};
use crate::schema::{TABLES, table_for_collection};
use crate::status::{ActivityKind, StatusRegistry};
use crate::store::RelationalTarget;
use crate::validation::ValidationResult;

/// What to undo.
#[derive(Debug, Clone, Default)]
pub struct RollbackConfig {
    /// Migration to roll back.
    pub migration_id: String,
    /// Drop the tables the migration wrote to.
    pub drop_tables: bool,
    /// Tables to drop in addition to those found in checkpoints.
    pub tables: Vec<String>,
    /// Keep checkpoints instead of deleting them.
    pub keep_checkpoints: bool,
    /// Backup to restore.
    pub backup_file: Option<PathBuf>,
    /// Store type of the backup; inferred from the sidecar or file name.
    pub backup_type: Option<BackupType>,
    /// Connection string for the restore tool.
    pub restore_connection: Option<String>,
    /// Database to restore into.
    pub restore_database: Option<String>,
    /// Rollback point selecting the backup; marked consumed on success.
    pub rollback_point: Option<String>,
    /// Plan without executing.
    pub dry_run: bool,
}

impl RollbackConfig {
    /// Create a configuration for a migration.
    pub fn new(migration_id: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            ..Self::default()
        }
    }

    /// Drop migrated tables.
    pub fn drop_tables(mut self, drop: bool) -> Self {
        self.drop_tables = drop;
        self
    }

    /// Also drop these tables.
    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Leave checkpoints in place.
    pub fn keep_checkpoints(mut self, keep: bool) -> Self {
        self.keep_checkpoints = keep;
        self
    }

    /// Restore a backup through `connection`.
    pub fn restore(
        mut self,
        backup_file: impl Into<PathBuf>,
        connection: impl Into<String>,
        database: Option<String>,
    ) -> Self {
        self.backup_file = Some(backup_file.into());
        self.restore_connection = Some(connection.into());
        self.restore_database = database;
        self
    }

    /// Set the backup store type explicitly.
    pub fn backup_type(mut self, backup_type: BackupType) -> Self {
        self.backup_type = Some(backup_type);
        self
    }

    /// Use a named rollback point.
    pub fn rollback_point(mut self, name: impl Into<String>) -> Self {
        self.rollback_point = Some(name.into());
        self
    }

    /// Plan only.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Kind of rollback step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum RollbackStep {
    /// Drop a table.
    DropTable(String),
    /// Delete every checkpoint of the migration.
    DeleteCheckpoints,
    /// Restore a backup file.
    RestoreBackup(PathBuf),
}

impl std::fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DropTable(table) => write!(f, "drop table {table}"),
            Self::DeleteCheckpoints => f.write_str("delete checkpoints"),
            Self::RestoreBackup(path) => write!(f, "restore {}", path.display()),
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackOperation {
    /// The step.
    pub step: RollbackStep,
    /// Whether it ran (false in dry runs and after cancellation).
    pub executed: bool,
    /// Whether it succeeded.
    pub is_success: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// Wall time.
    pub duration: Duration,
}

impl RollbackOperation {
    fn planned(step: RollbackStep) -> Self {
        Self {
            step,
            executed: false,
            is_success: false,
            error_message: None,
            duration: Duration::ZERO,
        }
    }
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackResult {
    /// Migration identity.
    pub migration_id: String,
    /// Every executed step succeeded.
    pub is_success: bool,
    /// Nothing was executed.
    pub dry_run: bool,
    /// Steps in execution order.
    pub operations: Vec<RollbackOperation>,
    /// The restored backup matched its recorded checksum.
    pub integrity_verified: bool,
    /// Rollback point consumed.
    pub rollback_point: Option<String>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Wall time.
    pub duration: Duration,
}

/// Executes rollbacks.
#[derive(Clone)]
pub struct RollbackService {
    target: Arc<dyn RelationalTarget>,
    repository: Arc<dyn CheckpointRepository>,
    backups: BackupService,
    registry: Option<Arc<StatusRegistry>>,
}

impl std::fmt::Debug for RollbackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackService").finish_non_exhaustive()
    }
}

impl RollbackService {
    /// Create the service.
    pub fn new(
        target: Arc<dyn RelationalTarget>,
        repository: Arc<dyn CheckpointRepository>,
        backups: BackupService,
    ) -> Self {
        Self {
            target,
            repository,
            backups,
            registry: None,
        }
    }

    /// Report progress through a status registry.
    pub fn with_registry(mut self, registry: Arc<StatusRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Check that a rollback can run.
    pub async fn validate_rollback(&self, config: &RollbackConfig) -> MigrateResult<ValidationResult> {
        if config.migration_id.is_empty() {
            return Err(MigrationError::invalid_argument("migration id is required"));
        }
        let mut result = ValidationResult::default();

        if let Err(err) = self.target.ping().await {
            result.error(format!("target unreachable: {err}"));
        }

        let point = match &config.rollback_point {
            Some(name) => match self.find_point(config, name).await? {
                Some(point) if point.consumed => {
                    result.error(format!("rollback point '{name}' was already used"));
                    Some(point)
                }
                Some(point) => Some(point),
                None => {
                    result.error(format!(
                        "rollback point '{name}' does not exist for migration '{}'",
                        config.migration_id
                    ));
                    None
                }
            },
            None => None,
        };

        match restore_source(config, point.as_ref()) {
            Some(path) => {
                if config.restore_connection.is_none() {
                    result.error("restoring a backup requires a connection string");
                }
                if !path.exists() {
                    result.error(format!("backup '{}' does not exist", path.display()));
                } else {
                    match self.backup_type_of(config, &path) {
                        Some(backup_type) => {
                            result.merge(self.backups.verify_backup(&path, backup_type).await)
                        }
                        None => result.error(format!(
                            "cannot tell the store type of backup '{}'",
                            path.display()
                        )),
                    }
                }
            }
            None if config.rollback_point.is_some() && point.is_some() => {
                result.warning("rollback point has no backup; nothing will be restored");
            }
            None => {}
        }

        if !config.drop_tables && config.keep_checkpoints && restore_source(config, point.as_ref()).is_none() {
            result.warning("nothing to roll back");
        }
        Ok(result)
    }

    /// Roll back a migration.
    pub async fn rollback(
        &self,
        config: &RollbackConfig,
        cancel: &CancellationToken,
    ) -> MigrateResult<RollbackResult> {
        let start = Instant::now();
        let migration_id = config.migration_id.as_str();
        let validation = self.validate_rollback(config).await?;

        let mut result = RollbackResult {
            migration_id: migration_id.to_string(),
            is_success: false,
            dry_run: config.dry_run,
            operations: Vec::new(),
            integrity_verified: false,
            rollback_point: None,
            error_message: None,
            duration: Duration::ZERO,
        };
        if !validation.is_valid() {
            warn!(migration_id, errors = ?validation.errors, "Rollback validation failed");
            result.error_message = Some(validation.errors.join("; "));
            result.duration = start.elapsed();
            return Ok(result);
        }

        let point = match &config.rollback_point {
            Some(name) => self.find_point(config, name).await?,
            None => None,
        };
        result.operations = self
            .plan(config, point.as_ref())
            .await?
            .into_iter()
            .map(RollbackOperation::planned)
            .collect();

        if config.dry_run {
            info!(migration_id, operations = result.operations.len(), "Rollback planned (dry run)");
            result.is_success = true;
            result.duration = start.elapsed();
            return Ok(result);
        }

        let activity = self
            .registry
            .as_ref()
            .map(|r| r.track(migration_id, ActivityKind::Rollback, "rollback"));
        info!(migration_id, operations = result.operations.len(), "Starting rollback");

        let mut failures = Vec::new();
        let mut drop_failed = false;
        for operation in &mut result.operations {
            if cancel.is_cancelled() {
                failures.push(MigrationError::Cancelled.to_string());
                break;
            }
            // Checkpoints name the tables to drop; keep them while any remain.
            if drop_failed && !matches!(operation.step, RollbackStep::DropTable(_)) {
                warn!(step = %operation.step, "Skipping rollback step after a failed table drop");
                operation.error_message = Some("skipped: a table could not be dropped".to_string());
                continue;
            }
            if let Some(activity) = &activity {
                activity.step(operation.step.to_string());
            }

            let op_start = Instant::now();
            let outcome = self.execute_step(config, &operation.step, cancel).await;
            operation.executed = true;
            operation.duration = op_start.elapsed();
            match outcome {
                Ok(verified) => {
                    operation.is_success = true;
                    result.integrity_verified |= verified;
                    debug!(step = %operation.step, "Rollback step done");
                }
                Err(err) => {
                    error!(step = %operation.step, error = %err, "Rollback step failed");
                    drop_failed |= matches!(operation.step, RollbackStep::DropTable(_));
                    operation.error_message = Some(err.to_string());
                    failures.push(format!("{}: {err}", operation.step));
                }
            }
        }
        drop(activity);

        result.is_success = failures.is_empty();
        if !failures.is_empty() {
            result.error_message = Some(failures.join("; "));
        }

        if result.is_success {
            if let Some(mut point) = point {
                point.consumed = true;
                self.repository.save_rollback_point(&point).await?;
                result.rollback_point = Some(point.name);
            }
        }
        result.duration = start.elapsed();

        let entry = if result.is_success {
            MigrationLog::info(migration_id, "Rollback completed")
        } else {
            MigrationLog::warn(migration_id, "Rollback failed")
        };
        let entry = entry
            .with("operations", result.operations.len() as u64)
            .with("integrity_verified", result.integrity_verified);
        if let Err(err) = self.repository.append_log(&entry).await {
            warn!(migration_id, error = %err, "Failed to persist log entry");
        }
        info!(
            migration_id,
            success = result.is_success,
            duration_ms = result.duration.as_millis() as u64,
            "Rollback finished"
        );
        Ok(result)
    }

    async fn plan(
        &self,
        config: &RollbackConfig,
        point: Option<&RollbackPoint>,
    ) -> MigrateResult<Vec<RollbackStep>> {
        let mut steps = Vec::new();
        if config.drop_tables {
            let mut tables: Vec<String> = self
                .repository
                .list_checkpoints(&config.migration_id)
                .await?
                .iter()
                .filter_map(|c| table_for_collection(&c.collection_name))
                .map(|t| t.table.to_string())
                .chain(config.tables.iter().cloned())
                .collect();
            tables.sort_by(|a, b| {
                creation_rank(b)
                    .cmp(&creation_rank(a))
                    .then_with(|| a.cmp(b))
            });
            tables.dedup();
            steps.extend(tables.into_iter().map(RollbackStep::DropTable));
        }
        if !config.keep_checkpoints {
            steps.push(RollbackStep::DeleteCheckpoints);
        }
        if let Some(path) = restore_source(config, point) {
            steps.push(RollbackStep::RestoreBackup(path));
        }
        Ok(steps)
    }

    /// Run one step. Returns whether a restored backup's checksum was verified.
    async fn execute_step(
        &self,
        config: &RollbackConfig,
        step: &RollbackStep,
        cancel: &CancellationToken,
    ) -> MigrateResult<bool> {
        match step {
            RollbackStep::DropTable(table) => {
                self.target.drop_table(table).await?;
                info!(table = %table, "Table dropped");
                Ok(false)
            }
            RollbackStep::DeleteCheckpoints => {
                let removed = self.repository.delete_checkpoints(&config.migration_id).await?;
                info!(migration_id = %config.migration_id, removed, "Checkpoints deleted");
                Ok(false)
            }
            RollbackStep::RestoreBackup(path) => {
                let backup_type = self.backup_type_of(config, path).ok_or_else(|| {
                    MigrationError::validation(format!(
                        "cannot tell the store type of backup '{}'",
                        path.display()
                    ))
                })?;
                let verification = self.backups.verify_backup(path, backup_type).await;
                if !verification.is_valid() {
                    return Err(MigrationError::validation(verification.errors.join("; ")));
                }
                let verified = read_sidecar(path)?.is_some();

                let connection = config.restore_connection.as_deref().ok_or_else(|| {
                    MigrationError::invalid_argument("restoring a backup requires a connection string")
                })?;
                let restored = self
                    .backups
                    .restore_backup(
                        path,
                        backup_type,
                        connection,
                        config.restore_database.as_deref(),
                        cancel,
                    )
                    .await?;
                if !restored.is_success {
                    return Err(MigrationError::other(
                        restored
                            .error_message
                            .unwrap_or_else(|| "restore failed".to_string()),
                    ));
                }
                Ok(verified)
            }
        }
    }

    async fn find_point(&self, config: &RollbackConfig, name: &str) -> MigrateResult<Option<RollbackPoint>> {
        Ok(self
            .repository
            .list_rollback_points(&config.migration_id)
            .await?
            .into_iter()
            .rev()
            .find(|p| p.name == name))
    }

    fn backup_type_of(&self, config: &RollbackConfig, path: &Path) -> Option<BackupType> {
        config
            .backup_type
            .or_else(|| read_sidecar(path).ok().flatten().map(|m| m.backup_type))
            .or_else(|| BackupType::from_path(path))
    }
}

fn restore_source(config: &RollbackConfig, point: Option<&RollbackPoint>) -> Option<PathBuf> {
    config
        .backup_file
        .clone()
        .or_else(|| point.and_then(|p| p.backup_path.clone()))
}

fn creation_rank(table: &str) -> usize {
    TABLES
        .iter()
        .position(|t| t.table == table)
        .unwrap_or(usize::MAX)
}
