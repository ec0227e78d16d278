//! Failure analysis and automated recovery.
//!
//! A failed migration is classified from what was persisted: the error
//! kinds recorded on failure log entries and the state of each checkpoint.
//! Remediations are [`RecoveryStrategy`] implementations held in a
//! [`StrategyRegistry`]; candidates are ranked by their weighted success
//! history, with estimated duration breaking ties.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::{BackupConfig, BackupService, BackupType};
use crate::checkpoint::{CheckpointStatus, MigrationLog, RecoveryAttempt};
use crate::config::MigrationConfig;
use crate::engine::{MigrationEngine, MigrationResult};
use crate::error::{ErrorKind, MigrateResult, MigrationError};
use crate::status::ActivityKind;

/// Half-life of the recency weight applied to past attempts.
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// Classified cause of a failed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// A store became unreachable.
    ConnectivityLoss,
    /// Source data could not be transformed or validated.
    DataCorruption,
    /// Memory, disk or connection limits were hit.
    ResourceExhaustion,
    /// Operations timed out or kept failing transiently.
    Timeout,
    /// Unique constraints were violated.
    ConstraintViolation,
    /// Anything else.
    Unknown,
}

impl FailureType {
    /// Classify an error kind.
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Connectivity => Self::ConnectivityLoss,
            ErrorKind::Validation | ErrorKind::Transformation => Self::DataCorruption,
            ErrorKind::ResourceExhaustion => Self::ResourceExhaustion,
            ErrorKind::Transient | ErrorKind::Timeout => Self::Timeout,
            ErrorKind::DuplicateKey => Self::ConstraintViolation,
            ErrorKind::Subprocess
            | ErrorKind::Cancelled
            | ErrorKind::Configuration
            | ErrorKind::Internal => Self::Unknown,
        }
    }

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectivityLoss => "connectivity_loss",
            Self::DataCorruption => "data_corruption",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Timeout => "timeout",
            Self::ConstraintViolation => "constraint_violation",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a snake-case name.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "connectivity_loss" => Self::ConnectivityLoss,
            "data_corruption" => Self::DataCorruption,
            "resource_exhaustion" => Self::ResourceExhaustion,
            "timeout" => Self::Timeout,
            "constraint_violation" => Self::ConstraintViolation,
            "unknown" => Self::Unknown,
            _ => return None,
        })
    }

    fn base_likelihood(&self) -> u8 {
        match self {
            Self::ConnectivityLoss => 80,
            Self::Timeout => 75,
            Self::ConstraintViolation => 70,
            Self::ResourceExhaustion => 65,
            Self::DataCorruption => 40,
            Self::Unknown => 30,
        }
    }
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strategy considered for a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyCandidate {
    /// Strategy name.
    pub name: String,
    /// Weighted historical success rate, 0..=1.
    pub success_rate: f64,
    /// Estimated execution time.
    pub estimated_duration: Duration,
}

/// Classification of a failed migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAnalysis {
    /// Migration identity.
    pub migration_id: String,
    /// Classified cause.
    pub failure_type: FailureType,
    /// Error kind of the most recent failure entry.
    pub error_kind: Option<ErrorKind>,
    /// Error text of the most recent failure entry.
    pub last_error: Option<String>,
    /// Collections whose checkpoint is not completed.
    pub incomplete_collections: Vec<String>,
    /// Processed documents across collections.
    pub documents_processed: u64,
    /// Total documents across collections.
    pub total_documents: u64,
    /// Whether a checkpoint exists to resume from.
    pub can_resume: bool,
    /// First incomplete checkpoint.
    pub resume_checkpoint_id: Option<String>,
    /// Estimated chance of recovery, 0..=100.
    pub recovery_likelihood: u8,
    /// Applicable strategies, best first.
    pub candidates: Vec<StrategyCandidate>,
}

impl FailureAnalysis {
    /// Documents left to process.
    pub fn remaining_documents(&self) -> u64 {
        self.total_documents.saturating_sub(self.documents_processed)
    }
}

/// Inputs shared by strategy executions.
pub struct RecoveryContext<'a> {
    /// Engine used to resume or rerun.
    pub engine: &'a MigrationEngine,
    /// Backup service for restore strategies.
    pub backups: &'a BackupService,
    /// Recovery settings.
    pub config: &'a RecoveryConfig,
    /// Migration settings for the rerun.
    pub migration: &'a MigrationConfig,
    /// The failure being recovered.
    pub analysis: &'a FailureAnalysis,
}

/// A named remediation procedure.
#[async_trait::async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Unique name.
    fn name(&self) -> &'static str;

    /// Whether the strategy can address the failure.
    fn is_applicable(&self, analysis: &FailureAnalysis, config: &RecoveryConfig) -> bool;

    /// Rough execution time.
    fn estimated_duration(&self, analysis: &FailureAnalysis) -> Duration;

    /// Execute once.
    async fn execute(
        &self,
        ctx: &RecoveryContext<'_>,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult>;
}

fn resume_target(analysis: &FailureAnalysis) -> &str {
    analysis
        .resume_checkpoint_id
        .as_deref()
        .unwrap_or(&analysis.migration_id)
}

/// Continue from the last checkpoint with the original settings.
#[derive(Debug, Default)]
pub struct ResumeFromCheckpoint;

#[async_trait::async_trait]
impl RecoveryStrategy for ResumeFromCheckpoint {
    fn name(&self) -> &'static str {
        "resume-from-checkpoint"
    }

    fn is_applicable(&self, analysis: &FailureAnalysis, config: &RecoveryConfig) -> bool {
        analysis.can_resume
            && match analysis.failure_type {
                FailureType::ConnectivityLoss | FailureType::Timeout | FailureType::Unknown => true,
                FailureType::DataCorruption => config.allow_data_skipping,
                FailureType::ResourceExhaustion | FailureType::ConstraintViolation => false,
            }
    }

    fn estimated_duration(&self, analysis: &FailureAnalysis) -> Duration {
        Duration::from_secs(10 + analysis.remaining_documents() / 2000)
    }

    async fn execute(
        &self,
        ctx: &RecoveryContext<'_>,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult> {
        ctx.engine
            .resume(ctx.migration, resume_target(ctx.analysis), cancel)
            .await
    }
}

/// Resume with half the batch size, reduced parallelism and duplicate
/// skipping.
#[derive(Debug, Default)]
pub struct RetryWithAdjustedParameters;

#[async_trait::async_trait]
impl RecoveryStrategy for RetryWithAdjustedParameters {
    fn name(&self) -> &'static str {
        "retry-with-adjusted-parameters"
    }

    fn is_applicable(&self, analysis: &FailureAnalysis, _config: &RecoveryConfig) -> bool {
        analysis.can_resume
            && matches!(
                analysis.failure_type,
                FailureType::ResourceExhaustion
                    | FailureType::ConstraintViolation
                    | FailureType::Timeout
                    | FailureType::Unknown
            )
    }

    fn estimated_duration(&self, analysis: &FailureAnalysis) -> Duration {
        Duration::from_secs(20 + analysis.remaining_documents() / 1000)
    }

    async fn execute(
        &self,
        ctx: &RecoveryContext<'_>,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult> {
        let adjusted = ctx.migration.with_adjusted_parameters();
        debug!(
            batch_size = adjusted.batch_size,
            parallelism = adjusted.max_degree_of_parallelism,
            "Retrying with adjusted parameters"
        );
        ctx.engine
            .resume(&adjusted, resume_target(ctx.analysis), cancel)
            .await
    }
}

/// Restore the relational store from a backup, then rerun from scratch with
/// duplicate skipping.
#[derive(Debug, Default)]
pub struct RestoreFromBackupThenRetry;

#[async_trait::async_trait]
impl RecoveryStrategy for RestoreFromBackupThenRetry {
    fn name(&self) -> &'static str {
        "restore-from-backup-then-retry"
    }

    fn is_applicable(&self, _analysis: &FailureAnalysis, config: &RecoveryConfig) -> bool {
        config.backup_file.is_some() && config.postgres_connection.is_some()
    }

    fn estimated_duration(&self, analysis: &FailureAnalysis) -> Duration {
        Duration::from_secs(120 + analysis.total_documents / 2000)
    }

    async fn execute(
        &self,
        ctx: &RecoveryContext<'_>,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult> {
        let (Some(path), Some(connection)) = (
            ctx.config.backup_file.as_deref(),
            ctx.config.postgres_connection.as_deref(),
        ) else {
            return Err(MigrationError::invalid_argument(
                "restore-from-backup-then-retry needs a backup file and a target connection",
            ));
        };

        let restored = ctx
            .backups
            .restore_backup(path, BackupType::Relational, connection, None, cancel)
            .await?;
        if !restored.is_success {
            return Err(MigrationError::process(
                "pg_restore",
                restored.error_message.unwrap_or_default(),
            ));
        }
        info!(path = %path.display(), "Target restored from backup");

        let removed = ctx
            .engine
            .repository()
            .delete_checkpoints(&ctx.analysis.migration_id)
            .await?;
        debug!(removed, "Checkpoints cleared before rerun");

        let rerun = ctx
            .migration
            .clone()
            .migration_id(ctx.analysis.migration_id.as_str())
            .drop_existing_tables(false)
            .skip_duplicates(true);
        ctx.engine.migrate(&rerun, cancel).await
    }
}

/// Strategies available to [`RecoveryService`].
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::empty()
            .register(ResumeFromCheckpoint)
            .register(RetryWithAdjustedParameters)
            .register(RestoreFromBackupThenRetry)
    }
}

impl StrategyRegistry {
    /// Create a registry with no strategies.
    pub fn empty() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Add a strategy. A strategy with the same name is replaced.
    pub fn register(mut self, strategy: impl RecoveryStrategy + 'static) -> Self {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(Arc::new(strategy));
        self
    }

    /// Look up a strategy by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies.iter().find(|s| s.name() == name).cloned()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Applicable strategies ranked best first.
    pub fn rank(
        &self,
        analysis: &FailureAnalysis,
        config: &RecoveryConfig,
        history: &[RecoveryAttempt],
        now: DateTime<Utc>,
    ) -> Vec<StrategyCandidate> {
        let mut candidates: Vec<StrategyCandidate> = self
            .strategies
            .iter()
            .filter(|s| s.is_applicable(analysis, config))
            .map(|s| StrategyCandidate {
                name: s.name().to_string(),
                success_rate: success_rate(s.name(), analysis.failure_type, history, now),
                estimated_duration: s.estimated_duration(analysis),
            })
            .collect();
        // Stable sort keeps registration order for full ties.
        candidates.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(a.estimated_duration.cmp(&b.estimated_duration))
        });
        candidates
    }
}

/// Recency-weighted success rate of a strategy on a failure type, with a
/// neutral prior so an untried strategy scores 0.5.
pub fn success_rate(
    strategy: &str,
    failure_type: FailureType,
    history: &[RecoveryAttempt],
    now: DateTime<Utc>,
) -> f64 {
    let (mut successes, mut weight) = (1.0, 2.0);
    for attempt in history
        .iter()
        .filter(|a| a.strategy == strategy && a.failure_type == failure_type)
    {
        let age_days = (now - attempt.started_at).num_seconds().max(0) as f64 / 86_400.0;
        let w = 0.5_f64.powf(age_days / RECENCY_HALF_LIFE_DAYS);
        weight += w;
        if attempt.succeeded {
            successes += w;
        }
    }
    successes / weight
}

/// Recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Migration to recover.
    pub migration_id: String,
    /// Strategy to use instead of the best-ranked one.
    pub strategy: Option<String>,
    /// Executions of the strategy before giving up.
    pub max_retry_attempts: u32,
    /// Fixed wait between executions.
    #[serde(with = "crate::retry::millis")]
    pub retry_delay: Duration,
    /// Back up the relational store before recovering.
    pub create_backup: bool,
    /// Where pre-recovery backups go.
    pub backup_directory: PathBuf,
    /// Backup used by the restore strategy.
    pub backup_file: Option<PathBuf>,
    /// Target connection string for backup and restore tools.
    pub postgres_connection: Option<String>,
    /// Let the rerun skip documents that fail transformation.
    pub allow_data_skipping: bool,
    /// Ceiling on skipped documents, as a percentage of the remaining set.
    pub max_data_skip_percentage: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            migration_id: String::new(),
            strategy: None,
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            create_backup: false,
            backup_directory: PathBuf::from("./backups"),
            backup_file: None,
            postgres_connection: None,
            allow_data_skipping: false,
            max_data_skip_percentage: 1.0,
        }
    }
}

impl RecoveryConfig {
    /// Create a configuration for a migration.
    pub fn new(migration_id: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            ..Self::default()
        }
    }

    /// Force a strategy.
    pub fn strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = Some(name.into());
        self
    }

    /// Set the attempt limit.
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the wait between attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Take a backup of the target first, written to `directory`.
    pub fn create_backup(mut self, directory: impl Into<PathBuf>) -> Self {
        self.create_backup = true;
        self.backup_directory = directory.into();
        self
    }

    /// Backup for the restore strategy.
    pub fn backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_file = Some(path.into());
        self
    }

    /// Target connection string.
    pub fn postgres_connection(mut self, connection: impl Into<String>) -> Self {
        self.postgres_connection = Some(connection.into());
        self
    }

    /// Allow skipping up to `percentage` of the remaining documents.
    pub fn allow_data_skipping(mut self, percentage: f64) -> Self {
        self.allow_data_skipping = true;
        self.max_data_skip_percentage = percentage;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.migration_id.is_empty() {
            return Err(MigrationError::invalid_argument("migration id is required"));
        }
        if self.max_retry_attempts == 0 {
            return Err(MigrationError::invalid_argument(
                "max_retry_attempts must be at least 1",
            ));
        }
        if !(0.0..=100.0).contains(&self.max_data_skip_percentage) {
            return Err(MigrationError::invalid_argument(
                "max_data_skip_percentage must be between 0 and 100",
            ));
        }
        Ok(())
    }
}

/// Outcome of a recovery.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    /// Migration identity.
    pub migration_id: String,
    /// The strategy brought the migration to completion.
    pub is_success: bool,
    /// Strategy used.
    pub strategy: Option<String>,
    /// Classified failure.
    pub failure_type: Option<FailureType>,
    /// Executions performed.
    pub attempts: u32,
    /// Documents skipped under the data-skip budget.
    pub documents_skipped: u64,
    /// The migration can still be resumed.
    pub can_resume_migration: bool,
    /// Checkpoint to resume from.
    pub resume_checkpoint_id: Option<String>,
    /// Pre-recovery backup.
    pub backup_path: Option<PathBuf>,
    /// Error text, on failure.
    pub error_message: Option<String>,
    /// Error classification, on failure.
    pub error_kind: Option<ErrorKind>,
    /// Result of the last execution.
    pub migration: Option<MigrationResult>,
    /// Wall time.
    pub duration: Duration,
}

impl RecoveryResult {
    fn failed(migration_id: &str, error: &MigrationError) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            is_success: false,
            strategy: None,
            failure_type: None,
            attempts: 0,
            documents_skipped: 0,
            can_resume_migration: false,
            resume_checkpoint_id: None,
            backup_path: None,
            error_message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            migration: None,
            duration: Duration::ZERO,
        }
    }
}

/// Analyzes failed migrations and executes recovery strategies.
pub struct RecoveryService {
    engine: MigrationEngine,
    backups: BackupService,
    strategies: StrategyRegistry,
}

impl std::fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryService")
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

impl RecoveryService {
    /// Create a service with the default strategies.
    pub fn new(engine: MigrationEngine, backups: BackupService) -> Self {
        Self {
            engine,
            backups,
            strategies: StrategyRegistry::default(),
        }
    }

    /// Replace the strategy registry.
    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    /// The strategy registry.
    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// Classify a failed migration from its persisted logs and checkpoints.
    pub async fn analyze_failure(&self, migration_id: &str) -> MigrateResult<FailureAnalysis> {
        self.analyze_with(migration_id, &RecoveryConfig::new(migration_id))
            .await
    }

    async fn analyze_with(
        &self,
        migration_id: &str,
        config: &RecoveryConfig,
    ) -> MigrateResult<FailureAnalysis> {
        let repository = self.engine.repository();
        let mut checkpoints = repository.list_checkpoints(migration_id).await?;
        let logs = repository.list_logs(migration_id).await?;
        if checkpoints.is_empty() && logs.is_empty() {
            return Err(MigrationError::CheckpointNotFound(migration_id.to_string()));
        }
        checkpoints.sort_by(|a, b| a.collection_name.cmp(&b.collection_name));

        let last_failure = logs
            .iter()
            .enumerate()
            .filter(|(_, l)| l.error_kind().is_some_and(|k| k != ErrorKind::Cancelled))
            .max_by_key(|(i, l)| (l.timestamp, *i))
            .map(|(_, l)| l);
        let error_kind = last_failure.and_then(MigrationLog::error_kind);
        let failure_type = error_kind.map(FailureType::from_kind).unwrap_or(FailureType::Unknown);

        let incomplete: Vec<_> = checkpoints
            .iter()
            .filter(|c| c.status != CheckpointStatus::Completed)
            .collect();
        let documents_processed = checkpoints
            .iter()
            .map(|c| c.documents_processed.min(c.total_documents))
            .sum();
        let total_documents = checkpoints.iter().map(|c| c.total_documents).sum();
        let history = repository.list_recovery_attempts().await?;
        let successes = history
            .iter()
            .filter(|a| a.migration_id == migration_id && a.succeeded)
            .count();

        let mut analysis = FailureAnalysis {
            migration_id: migration_id.to_string(),
            failure_type,
            error_kind,
            last_error: last_failure.and_then(|l| l.exception.clone()),
            incomplete_collections: incomplete.iter().map(|c| c.collection_name.clone()).collect(),
            documents_processed,
            total_documents,
            can_resume: !incomplete.is_empty(),
            resume_checkpoint_id: incomplete.first().map(|c| c.id.clone()),
            recovery_likelihood: 0,
            candidates: Vec::new(),
        };
        analysis.recovery_likelihood = likelihood(&analysis, successes);
        analysis.candidates = self.strategies.rank(&analysis, config, &history, Utc::now());

        debug!(
            migration_id,
            failure_type = %analysis.failure_type,
            likelihood = analysis.recovery_likelihood,
            candidates = analysis.candidates.len(),
            "Failure analyzed"
        );
        Ok(analysis)
    }

    /// Recover a failed migration. `migration` carries the settings for the
    /// rerun; when `None`, the settings logged at the start of the last run
    /// are used.
    pub async fn recover(
        &self,
        config: &RecoveryConfig,
        migration: Option<&MigrationConfig>,
        cancel: &CancellationToken,
    ) -> MigrateResult<RecoveryResult> {
        config.validate()?;
        let start = Instant::now();
        let migration_id = config.migration_id.as_str();

        let analysis = match self.analyze_with(migration_id, config).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(migration_id, error = %err, "Failure analysis failed");
                return Ok(RecoveryResult::failed(migration_id, &err));
            }
        };

        let strategy = match &config.strategy {
            Some(name) => match self.strategies.get(name) {
                Some(strategy) => {
                    if !strategy.is_applicable(&analysis, config) {
                        warn!(strategy = %name, failure_type = %analysis.failure_type, "Forcing a strategy that does not match the failure");
                    }
                    strategy
                }
                None => {
                    return Err(MigrationError::invalid_argument(format!(
                        "unknown recovery strategy '{name}' (known: {})",
                        self.strategies.names().join(", ")
                    )));
                }
            },
            None => match analysis
                .candidates
                .first()
                .and_then(|c| self.strategies.get(&c.name))
            {
                Some(strategy) => strategy,
                None => {
                    let err = MigrationError::other(format!(
                        "no recovery strategy applies to a {} failure",
                        analysis.failure_type
                    ));
                    let mut result = RecoveryResult::failed(migration_id, &err);
                    result.failure_type = Some(analysis.failure_type);
                    result.can_resume_migration = analysis.can_resume;
                    result.resume_checkpoint_id = analysis.resume_checkpoint_id.clone();
                    return Ok(result);
                }
            },
        };

        let mut migration = match migration {
            Some(m) => m.clone(),
            None => self.logged_config(migration_id).await?,
        }
        .migration_id(migration_id);
        if config.allow_data_skipping {
            let budget = (analysis.remaining_documents() as f64 * config.max_data_skip_percentage
                / 100.0)
                .floor() as u64;
            migration = migration.max_skipped_documents(budget);
        }

        let registry = Arc::clone(self.engine.registry());
        let activity = registry.track(migration_id, ActivityKind::Recovery, strategy.name());
        info!(
            migration_id,
            strategy = strategy.name(),
            failure_type = %analysis.failure_type,
            likelihood = analysis.recovery_likelihood,
            "Starting recovery"
        );
        self.log(
            MigrationLog::info(migration_id, "Recovery started")
                .with("strategy", strategy.name())
                .with("failure_type", analysis.failure_type.as_str()),
        )
        .await;

        let mut result = RecoveryResult {
            migration_id: migration_id.to_string(),
            is_success: false,
            strategy: Some(strategy.name().to_string()),
            failure_type: Some(analysis.failure_type),
            attempts: 0,
            documents_skipped: 0,
            can_resume_migration: false,
            resume_checkpoint_id: None,
            backup_path: None,
            error_message: None,
            error_kind: None,
            migration: None,
            duration: Duration::ZERO,
        };

        if config.create_backup {
            activity.step("backup");
            match self.pre_recovery_backup(config, cancel).await {
                Ok(path) => result.backup_path = Some(path),
                Err(err) => {
                    warn!(migration_id, error = %err, "Pre-recovery backup failed");
                    result.error_message = Some(err.to_string());
                    result.error_kind = Some(err.kind());
                    result.can_resume_migration = analysis.can_resume;
                    result.resume_checkpoint_id = analysis.resume_checkpoint_id.clone();
                    result.duration = start.elapsed();
                    return Ok(result);
                }
            }
        }

        let ctx = RecoveryContext {
            engine: &self.engine,
            backups: &self.backups,
            config,
            migration: &migration,
            analysis: &analysis,
        };
        for attempt in 1..=config.max_retry_attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            activity.step(format!("attempt {attempt}"));
            result.attempts = attempt;

            let started_at = Utc::now();
            let attempt_start = Instant::now();
            let outcome = strategy.execute(&ctx, cancel).await;
            let succeeded = matches!(&outcome, Ok(r) if r.is_success);
            let record = RecoveryAttempt {
                migration_id: migration_id.to_string(),
                strategy: strategy.name().to_string(),
                failure_type: analysis.failure_type,
                succeeded,
                started_at,
                duration_ms: attempt_start.elapsed().as_millis() as u64,
            };
            if let Err(err) = self.engine.repository().record_recovery_attempt(&record).await {
                warn!(migration_id, error = %err, "Failed to record recovery attempt");
            }

            match outcome {
                Ok(run) => {
                    result.documents_skipped += run.statistics.documents_failed;
                    result.error_message = run.error_message.clone();
                    result.error_kind = run.error_kind;
                    let stop = run.is_success || run.is_cancelled();
                    result.migration = Some(run);
                    if succeeded {
                        result.is_success = true;
                    }
                    if stop {
                        break;
                    }
                }
                Err(err @ MigrationError::InvalidArgument(_)) => return Err(err),
                Err(err) => {
                    result.error_message = Some(err.to_string());
                    result.error_kind = Some(err.kind());
                }
            }
            warn!(migration_id, attempt, error = ?result.error_message, "Recovery attempt failed");
        }
        drop(activity);

        if !result.is_success {
            let checkpoints = self.engine.repository().list_checkpoints(migration_id).await?;
            let mut open: Vec<_> = checkpoints
                .into_iter()
                .filter(|c| c.status != CheckpointStatus::Completed)
                .collect();
            open.sort_by(|a, b| a.collection_name.cmp(&b.collection_name));
            result.can_resume_migration = !open.is_empty();
            result.resume_checkpoint_id = open.first().map(|c| c.id.clone());
            if cancel.is_cancelled() && result.error_kind.is_none() {
                result.error_message = Some(MigrationError::Cancelled.to_string());
                result.error_kind = Some(ErrorKind::Cancelled);
            }
        }
        result.duration = start.elapsed();

        let entry = if result.is_success {
            MigrationLog::info(migration_id, "Recovery succeeded")
        } else {
            MigrationLog::warn(migration_id, "Recovery failed")
        };
        self.log(
            entry
                .with("strategy", strategy.name())
                .with("attempts", result.attempts),
        )
        .await;
        info!(
            migration_id,
            success = result.is_success,
            attempts = result.attempts,
            duration_ms = result.duration.as_millis() as u64,
            "Recovery finished"
        );
        Ok(result)
    }

    async fn logged_config(&self, migration_id: &str) -> MigrateResult<MigrationConfig> {
        let logs = self.engine.repository().list_logs(migration_id).await?;
        let logged = logs
            .iter()
            .rev()
            .find_map(|l| l.metadata.get("config").cloned())
            .ok_or_else(|| {
                MigrationError::invalid_argument(format!(
                    "no recorded settings for migration '{migration_id}'; pass them explicitly"
                ))
            })?;
        Ok(serde_json::from_value(logged)?)
    }

    async fn pre_recovery_backup(
        &self,
        config: &RecoveryConfig,
        cancel: &CancellationToken,
    ) -> MigrateResult<PathBuf> {
        let connection = config.postgres_connection.as_deref().ok_or_else(|| {
            MigrationError::invalid_argument("a target connection is required to back it up")
        })?;
        let backup = BackupConfig::relational(connection, database_name(connection), &config.backup_directory)
            .compress(true)
            .verify(true);
        let result = self.backups.create_backup(&backup, cancel).await?;
        match (result.is_success, result.metadata) {
            (true, Some(metadata)) => {
                debug!(path = %metadata.file_path.display(), "Pre-recovery backup created");
                Ok(metadata.file_path)
            }
            _ => Err(MigrationError::process(
                "pg_dump",
                result.error_message.unwrap_or_else(|| "backup failed".to_string()),
            )),
        }
    }

    async fn log(&self, entry: MigrationLog) {
        if let Err(err) = self.engine.repository().append_log(&entry).await {
            warn!(migration_id = %entry.migration_id, error = %err, "Failed to persist log entry");
        }
    }
}

fn likelihood(analysis: &FailureAnalysis, successful_recoveries: usize) -> u8 {
    let base = u64::from(analysis.failure_type.base_likelihood());
    let progress_bonus = if analysis.total_documents == 0 {
        0
    } else {
        analysis.documents_processed * 10 / analysis.total_documents
    };
    let history_bonus = (successful_recoveries as u64 * 5).min(10);
    (base + progress_bonus + history_bonus).min(100) as u8
}

/// Database name from a `postgres://` URL or key-value connection string.
fn database_name(connection: &str) -> String {
    if let Some(rest) = connection.split_once("://").map(|(_, r)| r) {
        let path = rest.split('?').next().unwrap_or(rest);
        if let Some((_, db)) = path.rsplit_once('/') {
            if !db.is_empty() {
                return db.to_string();
            }
        }
    } else if let Some(db) = connection
        .split_whitespace()
        .find_map(|kv| kv.strip_prefix("dbname="))
    {
        return db.to_string();
    }
    "postgres".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn analysis(failure_type: FailureType, can_resume: bool) -> FailureAnalysis {
        FailureAnalysis {
            migration_id: "m".to_string(),
            failure_type,
            error_kind: None,
            last_error: None,
            incomplete_collections: vec!["entries".to_string()],
            documents_processed: 4000,
            total_documents: 10_000,
            can_resume,
            resume_checkpoint_id: can_resume.then(|| "m/entries".to_string()),
            recovery_likelihood: 0,
            candidates: Vec::new(),
        }
    }

    fn attempt(strategy: &str, succeeded: bool, age_days: i64) -> RecoveryAttempt {
        RecoveryAttempt {
            migration_id: "other".to_string(),
            strategy: strategy.to_string(),
            failure_type: FailureType::Timeout,
            succeeded,
            started_at: Utc::now() - ChronoDuration::days(age_days),
            duration_ms: 10,
        }
    }

    #[test]
    fn test_failure_type_from_kind() {
        assert_eq!(FailureType::from_kind(ErrorKind::Connectivity), FailureType::ConnectivityLoss);
        assert_eq!(FailureType::from_kind(ErrorKind::DuplicateKey), FailureType::ConstraintViolation);
        assert_eq!(FailureType::from_kind(ErrorKind::Transformation), FailureType::DataCorruption);
        assert_eq!(FailureType::from_kind(ErrorKind::Transient), FailureType::Timeout);
        assert_eq!(FailureType::from_kind(ErrorKind::Internal), FailureType::Unknown);
        assert_eq!(FailureType::parse("resource_exhaustion"), Some(FailureType::ResourceExhaustion));
    }

    #[test]
    fn test_untried_strategies_rank_by_estimated_time() {
        let registry = StrategyRegistry::default();
        let ranked = registry.rank(
            &analysis(FailureType::Timeout, true),
            &RecoveryConfig::new("m"),
            &[],
            Utc::now(),
        );
        let names: Vec<&str> = ranked.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["resume-from-checkpoint", "retry-with-adjusted-parameters"]);
        assert!((ranked[0].success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_history_outranks_estimate() {
        let registry = StrategyRegistry::default();
        let history = vec![
            attempt("resume-from-checkpoint", false, 1),
            attempt("resume-from-checkpoint", false, 2),
            attempt("retry-with-adjusted-parameters", true, 1),
        ];
        let ranked = registry.rank(
            &analysis(FailureType::Timeout, true),
            &RecoveryConfig::new("m"),
            &history,
            Utc::now(),
        );
        assert_eq!(ranked[0].name, "retry-with-adjusted-parameters");
    }

    #[test]
    fn test_recent_attempts_weigh_more() {
        let now = Utc::now();
        let recent_failure = vec![attempt("s", true, 365), attempt("s", false, 0)];
        let recent_success = vec![attempt("s", false, 365), attempt("s", true, 0)];
        assert!(
            success_rate("s", FailureType::Timeout, &recent_success, now)
                > success_rate("s", FailureType::Timeout, &recent_failure, now)
        );
    }

    #[test]
    fn test_restore_needs_backup_file() {
        let registry = StrategyRegistry::default();
        let a = analysis(FailureType::DataCorruption, false);
        assert!(registry.rank(&a, &RecoveryConfig::new("m"), &[], Utc::now()).is_empty());

        let config = RecoveryConfig::new("m")
            .backup_file("/backups/care.dump")
            .postgres_connection("postgres://localhost/care");
        let ranked = registry.rank(&a, &config, &[], Utc::now());
        assert_eq!(ranked[0].name, "restore-from-backup-then-retry");
    }

    #[test]
    fn test_likelihood_grows_with_progress() {
        let mut a = analysis(FailureType::ConnectivityLoss, true);
        let before = likelihood(&a, 0);
        a.documents_processed = 9000;
        assert!(likelihood(&a, 0) > before);
        assert!(likelihood(&a, 1) > likelihood(&a, 0));
        assert!(likelihood(&a, 10) <= 100);
    }

    #[test]
    fn test_config_validation() {
        assert!(RecoveryConfig::new("").validate().is_err());
        assert!(RecoveryConfig::new("m").max_retry_attempts(0).validate().is_err());
        assert!(RecoveryConfig::new("m").allow_data_skipping(150.0).validate().is_err());
        assert!(RecoveryConfig::new("m").validate().is_ok());
    }

    #[test]
    fn test_database_name() {
        assert_eq!(database_name("postgres://u:p@host:5432/care?sslmode=disable"), "care");
        assert_eq!(database_name("host=localhost dbname=care user=x"), "care");
        assert_eq!(database_name("postgres://host"), "postgres");
    }
}
