//! Migration engine implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::MemoryBudget;
use crate::checkpoint::{
    CheckpointRepository, CheckpointStatus, MigrationCheckpoint, MigrationLog, RollbackPoint,
    parse_checkpoint_id,
};
use crate::config::MigrationConfig;
use crate::error::{ErrorKind, MigrateResult, MigrationError};
use crate::index::{
    IndexCreationOptions, IndexCreationResult, IndexDropOptions, IndexDropResult,
    IndexOptimizationService, IndexStrategy,
};
use crate::introspect::SchemaIntrospectionService;
use crate::retry::Retry;
use crate::schema::{TableDefinition, TargetRecord, table_for_collection};
use crate::status::{ActivityKind, MigrationState, MigrationStatus, StatusRegistry};
use crate::store::{
    BatchRequest, ConflictPolicy, DocumentSource, RelationalTarget, SourceFilter, SourcePosition,
};
use crate::transform::{DataTransformationService, TransformFailure, TransformOptions};
use crate::validation::{ValidationOptions, ValidationResult, ValidationService};

/// Memory reserved per document before a collection's first batch is measured.
const INITIAL_DOCUMENT_ESTIMATE: usize = 1024;

/// Per-collection figures of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStatistics {
    /// Source collection.
    pub collection: String,
    /// Target table.
    pub table: String,
    /// Documents matching the filter.
    pub total_documents: u64,
    /// Documents already processed when this run started.
    pub resumed_from: u64,
    /// Documents handled by this run.
    pub documents_processed: u64,
    /// Rows written by this run.
    pub documents_inserted: u64,
    /// Duplicates skipped by this run.
    pub documents_skipped: u64,
    /// Documents that failed transformation in this run.
    pub documents_failed: u64,
    /// Batches written by this run.
    pub batches: u64,
    /// Wall time.
    pub duration: Duration,
    /// Checkpoint status at the end of the run.
    pub status: CheckpointStatus,
}

impl CollectionStatistics {
    fn new(table: &TableDefinition, checkpoint: &MigrationCheckpoint) -> Self {
        Self {
            collection: table.collection.to_string(),
            table: table.table.to_string(),
            total_documents: checkpoint.total_documents,
            resumed_from: checkpoint.documents_processed,
            documents_processed: 0,
            documents_inserted: 0,
            documents_skipped: 0,
            documents_failed: 0,
            batches: 0,
            duration: Duration::ZERO,
            status: checkpoint.status,
        }
    }

    /// Documents per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.documents_processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Aggregate figures of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationStatistics {
    /// Sum of collection totals.
    pub total_documents: u64,
    /// Documents handled by this run.
    pub documents_processed: u64,
    /// Rows written.
    pub documents_inserted: u64,
    /// Duplicates skipped.
    pub documents_skipped: u64,
    /// Transformation failures.
    pub documents_failed: u64,
    /// Batches written.
    pub batches: u64,
    /// Highest memory estimate held at once.
    pub peak_memory_bytes: usize,
    /// Times a fetch waited for the memory ceiling.
    pub throttle_events: u64,
    /// Transient-error retries.
    pub retries: u64,
    /// Wall time.
    pub duration: Duration,
}

/// Index work performed after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    /// Recommended strategies, in execution order.
    pub recommended: Vec<IndexStrategy>,
    /// Recommendations were reported, not executed.
    pub deferred: bool,
    /// Indexes dropped first.
    pub dropped: Vec<IndexDropResult>,
    /// Creation outcomes.
    pub created: Vec<IndexCreationResult>,
    /// Set when the index phase itself failed.
    pub error_message: Option<String>,
}

impl IndexReport {
    /// Index builds that failed.
    pub fn failed_count(&self) -> usize {
        self.created.iter().filter(|r| !r.is_success).count()
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationResult {
    /// Migration identity.
    pub migration_id: String,
    /// Every collection completed.
    pub is_success: bool,
    /// Checkpoint to resume from when the run did not complete.
    pub checkpoint_id: Option<String>,
    /// First error encountered.
    pub error_message: Option<String>,
    /// Classification of that error.
    pub error_kind: Option<ErrorKind>,
    /// Per-collection figures.
    pub collections: Vec<CollectionStatistics>,
    /// Aggregate figures.
    pub statistics: MigrationStatistics,
    /// Index phase, when it ran.
    pub indexes: Option<IndexReport>,
}

impl MigrationResult {
    /// A run that failed before any collection started.
    pub fn failed(migration_id: &str, error: &MigrationError) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            is_success: false,
            checkpoint_id: None,
            error_message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            collections: Vec::new(),
            statistics: MigrationStatistics::default(),
            indexes: None,
        }
    }

    /// Whether the run stopped because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }

    /// Get a summary of the result.
    pub fn summary(&self) -> String {
        let stats = &self.statistics;
        let mut parts = vec![format!("{} documents processed", stats.documents_processed)];
        if stats.documents_skipped > 0 {
            parts.push(format!("{} skipped", stats.documents_skipped));
        }
        if stats.documents_failed > 0 {
            parts.push(format!("{} failed", stats.documents_failed));
        }
        format!(
            "{} in {}ms across {} collection(s)",
            parts.join(", "),
            stats.duration.as_millis(),
            self.collections.len()
        )
    }
}

struct CollectionOutcome {
    stats: CollectionStatistics,
    checkpoint_id: String,
    error: Option<MigrationError>,
}

/// Emits rollback points as overall progress crosses each interval.
#[derive(Debug)]
struct ProgressTracker {
    interval: u64,
    totals: BTreeMap<String, u64>,
    processed: BTreeMap<String, u64>,
    reached: u64,
    next_sequence: u32,
}

impl ProgressTracker {
    fn new(interval: u8, checkpoints: &[MigrationCheckpoint], existing_points: usize) -> Self {
        let mut tracker = Self {
            interval: u64::from(interval),
            totals: BTreeMap::new(),
            processed: BTreeMap::new(),
            reached: 0,
            next_sequence: existing_points as u32 + 1,
        };
        for checkpoint in checkpoints {
            tracker
                .totals
                .insert(checkpoint.collection_name.clone(), checkpoint.total_documents);
            tracker.processed.insert(
                checkpoint.collection_name.clone(),
                checkpoint.documents_processed,
            );
        }
        if tracker.interval > 0 {
            tracker.reached = tracker.percent() / tracker.interval * tracker.interval;
        }
        tracker
    }

    fn percent(&self) -> u64 {
        let total: u64 = self.totals.values().sum();
        if total == 0 {
            return 0;
        }
        let done: u64 = self
            .processed
            .iter()
            .map(|(c, p)| (*p).min(self.totals.get(c).copied().unwrap_or(0)))
            .sum();
        done * 100 / total
    }

    fn update(&mut self, migration_id: &str, collection: &str, processed: u64) -> Vec<RollbackPoint> {
        self.processed.insert(collection.to_string(), processed);
        let mut points = Vec::new();
        if self.interval == 0 {
            return points;
        }
        let percent = self.percent();
        while self.reached + self.interval <= percent {
            self.reached += self.interval;
            let mut point = RollbackPoint::new(
                migration_id,
                format!("progress-{}", self.reached),
                self.next_sequence,
            );
            point.progress = self.processed.clone();
            self.next_sequence += 1;
            points.push(point);
        }
        points
    }
}

struct RunContext<'a> {
    config: &'a MigrationConfig,
    cancel: &'a CancellationToken,
    budget: Arc<MemoryBudget>,
    retries: AtomicU64,
    skipped_failures: AtomicU64,
    progress: Mutex<ProgressTracker>,
}

/// The migration engine.
#[derive(Clone)]
pub struct MigrationEngine {
    source: Arc<dyn DocumentSource>,
    target: Arc<dyn RelationalTarget>,
    repository: Arc<dyn CheckpointRepository>,
    registry: Arc<StatusRegistry>,
    transformer: DataTransformationService,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("database", &self.source.database_name())
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    /// Create a new migration engine.
    pub fn new(
        source: Arc<dyn DocumentSource>,
        target: Arc<dyn RelationalTarget>,
        repository: Arc<dyn CheckpointRepository>,
    ) -> Self {
        Self {
            source,
            target,
            repository,
            registry: StatusRegistry::new(),
            transformer: DataTransformationService::new(),
        }
    }

    /// Share a status registry with other engines or services.
    pub fn with_registry(mut self, registry: Arc<StatusRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// The document store.
    pub fn source(&self) -> &Arc<dyn DocumentSource> {
        &self.source
    }

    /// The relational store.
    pub fn target(&self) -> &Arc<dyn RelationalTarget> {
        &self.target
    }

    /// The checkpoint and log store.
    pub fn repository(&self) -> &Arc<dyn CheckpointRepository> {
        &self.repository
    }

    /// The status registry.
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    /// Run a migration from the start. Existing checkpoints of the same
    /// migration id are discarded.
    pub async fn migrate(
        &self,
        config: &MigrationConfig,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult> {
        config.validate()?;
        self.run(config, None, cancel).await
    }

    /// Continue a previous run. `checkpoint_id` is a checkpoint id
    /// (`"{migration_id}/{collection}"`) or a bare migration id; the
    /// migration id of `config` is replaced by it.
    pub async fn resume(
        &self,
        config: &MigrationConfig,
        checkpoint_id: &str,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult> {
        config.validate()?;
        let migration_id = parse_checkpoint_id(checkpoint_id)
            .map(|(m, _)| m)
            .unwrap_or(checkpoint_id);
        if migration_id.is_empty() {
            return Err(MigrationError::invalid_argument("checkpoint id is empty"));
        }

        self.repository.initialize().await?;
        let checkpoints = self.repository.list_checkpoints(migration_id).await?;
        if checkpoints.is_empty() {
            let err = MigrationError::CheckpointNotFound(checkpoint_id.to_string());
            warn!(checkpoint_id, "Nothing to resume");
            return Ok(MigrationResult::failed(migration_id, &err));
        }

        let config = config.clone().migration_id(migration_id);
        self.run(&config, Some(checkpoints), cancel).await
    }

    /// Progress of a migration.
    pub async fn status(&self, migration_id: &str) -> MigrateResult<MigrationStatus> {
        let mut collections = self.repository.list_checkpoints(migration_id).await?;
        collections.sort_by(|a, b| a.collection_name.cmp(&b.collection_name));
        let points = self.repository.list_rollback_points(migration_id).await?;
        let running = self.registry.is_running(migration_id);

        Ok(MigrationStatus {
            migration_id: migration_id.to_string(),
            state: MigrationState::from_checkpoints(&collections, running),
            documents_processed: collections.iter().map(|c| c.documents_processed).sum(),
            documents_skipped: collections.iter().map(|c| c.documents_skipped).sum(),
            total_documents: collections.iter().map(|c| c.total_documents).sum(),
            last_update: collections.iter().map(|c| c.last_update).max(),
            rollback_points: points.len(),
            rollback: self.registry.activity(migration_id, ActivityKind::Rollback),
            recovery: self.registry.activity(migration_id, ActivityKind::Recovery),
            collections,
        })
    }

    /// Schema and data validation without touching the target.
    pub async fn validate(
        &self,
        config: &MigrationConfig,
        options: &ValidationOptions,
    ) -> MigrateResult<ValidationResult> {
        self.validator().validate(config, options).await
    }

    /// [`validate`](Self::validate) plus sizing checks.
    pub async fn validate_pre_migration(
        &self,
        config: &MigrationConfig,
        options: &ValidationOptions,
    ) -> MigrateResult<ValidationResult> {
        self.validator().validate_pre_migration(config, options).await
    }

    fn validator(&self) -> ValidationService {
        ValidationService::new(Arc::clone(&self.source), Arc::clone(&self.target))
    }

    async fn run(
        &self,
        config: &MigrationConfig,
        resume_from: Option<Vec<MigrationCheckpoint>>,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationResult> {
        let start = Instant::now();
        let migration_id = config.migration_id.as_str();

        let _run = match self.registry.begin_run(migration_id) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(migration_id, "Migration already running in this process");
                return Ok(MigrationResult::failed(migration_id, &err));
            }
        };
        let _lock = match self.repository.acquire_lock(migration_id).await {
            Ok(lock) => lock,
            Err(err) => {
                warn!(migration_id, error = %err, "Could not lock migration");
                return Ok(MigrationResult::failed(migration_id, &err));
            }
        };

        match self.execute(config, resume_from, cancel, start).await {
            Ok(result) => Ok(result),
            Err(err @ MigrationError::InvalidArgument(_)) => Err(err),
            Err(err) => {
                error!(migration_id, error = %err, "Migration failed");
                self.log(MigrationLog::failure(migration_id, "Migration failed", &err))
                    .await;
                let mut result = MigrationResult::failed(migration_id, &err);
                result.checkpoint_id = self.first_incomplete(migration_id).await;
                result.statistics.duration = start.elapsed();
                Ok(result)
            }
        }
    }

    async fn first_incomplete(&self, migration_id: &str) -> Option<String> {
        let mut checkpoints = self.repository.list_checkpoints(migration_id).await.ok()?;
        checkpoints.sort_by(|a, b| a.collection_name.cmp(&b.collection_name));
        checkpoints
            .into_iter()
            .find(|c| c.status != CheckpointStatus::Completed)
            .map(|c| c.id)
    }

    async fn execute(
        &self,
        config: &MigrationConfig,
        resume_from: Option<Vec<MigrationCheckpoint>>,
        cancel: &CancellationToken,
        start: Instant,
    ) -> MigrateResult<MigrationResult> {
        let migration_id = config.migration_id.as_str();
        let resuming = resume_from.is_some();
        self.repository.initialize().await?;
        self.log(
            MigrationLog::info(
                migration_id,
                if resuming { "Migration resumed" } else { "Migration started" },
            )
            .with("config", serde_json::to_value(config)?),
        )
        .await;
        info!(migration_id, resuming, batch_size = config.batch_size, "Starting migration");

        let plan = match resume_from {
            Some(checkpoints) => self.plan_resume(config, checkpoints, cancel).await?,
            None => self.plan_fresh(config, cancel).await?,
        };
        let checkpoints: Vec<MigrationCheckpoint> = plan.iter().map(|(_, c)| c.clone()).collect();
        let existing_points = self.repository.list_rollback_points(migration_id).await?.len();

        let ctx = RunContext {
            config,
            cancel,
            budget: MemoryBudget::new(config.memory_ceiling_bytes()),
            retries: AtomicU64::new(0),
            skipped_failures: AtomicU64::new(0),
            progress: Mutex::new(ProgressTracker::new(
                config.rollback_point_interval,
                &checkpoints,
                existing_points,
            )),
        };

        let slots = Semaphore::new(config.max_degree_of_parallelism);
        let outcomes = join_all(plan.into_iter().map(|(table, checkpoint)| {
            let ctx = &ctx;
            let slots = &slots;
            async move {
                let _slot = slots.acquire().await;
                self.migrate_collection(ctx, table, checkpoint).await
            }
        }))
        .await;

        let mut result = MigrationResult {
            migration_id: migration_id.to_string(),
            is_success: true,
            checkpoint_id: None,
            error_message: None,
            error_kind: None,
            collections: Vec::with_capacity(outcomes.len()),
            statistics: MigrationStatistics::default(),
            indexes: None,
        };
        let mut cancelled = false;
        for outcome in outcomes {
            let stats = &mut result.statistics;
            stats.total_documents += outcome.stats.total_documents;
            stats.documents_processed += outcome.stats.documents_processed;
            stats.documents_inserted += outcome.stats.documents_inserted;
            stats.documents_skipped += outcome.stats.documents_skipped;
            stats.documents_failed += outcome.stats.documents_failed;
            stats.batches += outcome.stats.batches;

            if outcome.stats.status != CheckpointStatus::Completed {
                result.is_success = false;
                result.checkpoint_id.get_or_insert(outcome.checkpoint_id);
            }
            match outcome.error {
                Some(MigrationError::Cancelled) => cancelled = true,
                Some(err) if result.error_message.is_none() => {
                    result.error_message = Some(err.to_string());
                    result.error_kind = Some(err.kind());
                }
                _ => {}
            }
            result.collections.push(outcome.stats);
        }
        if cancelled && result.error_kind.is_none() {
            result.error_message = Some(MigrationError::Cancelled.to_string());
            result.error_kind = Some(ErrorKind::Cancelled);
        }

        if result.is_success && !config.skip_index_creation {
            let tables: Vec<String> = result.collections.iter().map(|c| c.collection.clone()).collect();
            result.indexes = Some(match self.build_indexes(config, &tables, cancel).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(migration_id, error = %err, "Index phase failed");
                    IndexReport {
                        error_message: Some(err.to_string()),
                        ..IndexReport::default()
                    }
                }
            });
        }

        result.statistics.peak_memory_bytes = ctx.budget.peak();
        result.statistics.throttle_events = ctx.budget.throttle_events();
        result.statistics.retries = ctx.retries.load(Ordering::Relaxed);
        result.statistics.duration = start.elapsed();

        if result.is_success {
            info!(migration_id, summary = %result.summary(), "Migration completed");
            self.log(
                MigrationLog::info(migration_id, "Migration completed")
                    .with("documents_processed", result.statistics.documents_processed)
                    .with("duration_ms", result.statistics.duration.as_millis() as u64),
            )
            .await;
        } else if result.is_cancelled() {
            warn!(migration_id, checkpoint_id = ?result.checkpoint_id, "Migration cancelled");
        } else {
            error!(
                migration_id,
                checkpoint_id = ?result.checkpoint_id,
                error = ?result.error_message,
                "Migration did not complete"
            );
        }
        Ok(result)
    }

    async fn plan_fresh(
        &self,
        config: &MigrationConfig,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<(&'static TableDefinition, MigrationCheckpoint)>> {
        let migration_id = config.migration_id.as_str();
        let mut resolution = ValidationResult::default();
        let collections = self.validator().resolve_collections(config, &mut resolution).await?;
        if !resolution.is_valid() {
            return Err(MigrationError::validation(resolution.errors.join("; ")));
        }

        let removed = self.repository.delete_checkpoints(migration_id).await?;
        if removed > 0 {
            debug!(migration_id, removed, "Discarded previous checkpoints");
        }

        // The whole plan is persisted before any DDL or count, so a run that
        // fails while preparing still resumes every collection.
        let mut planned = Vec::with_capacity(collections.len());
        for collection in &collections {
            let Some(table) = table_for_collection(collection) else {
                continue;
            };
            let checkpoint = MigrationCheckpoint::planned(migration_id, collection);
            self.repository.save_checkpoint(&checkpoint).await?;
            planned.push((table, checkpoint));
        }

        let retries = AtomicU64::new(0);
        let retry = Retry::new(&config.retry, cancel).count_into(&retries);
        let mut plan = Vec::with_capacity(planned.len());
        for (table, mut checkpoint) in planned {
            if config.drop_existing_tables {
                info!(table = table.table, "Dropping existing table");
                self.target.drop_table(table.table).await?;
            }
            self.prepare(config, &retry, table, &mut checkpoint).await?;
            plan.push((table, checkpoint));
        }
        Ok(plan)
    }

    async fn plan_resume(
        &self,
        config: &MigrationConfig,
        mut checkpoints: Vec<MigrationCheckpoint>,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<(&'static TableDefinition, MigrationCheckpoint)>> {
        checkpoints.sort_by(|a, b| a.collection_name.cmp(&b.collection_name));
        let retries = AtomicU64::new(0);
        let retry = Retry::new(&config.retry, cancel).count_into(&retries);
        let mut plan = Vec::with_capacity(checkpoints.len());
        for mut checkpoint in checkpoints {
            let table = table_for_collection(&checkpoint.collection_name).ok_or_else(|| {
                MigrationError::validation(format!(
                    "checkpoint '{}' names a collection without a target mapping",
                    checkpoint.id
                ))
            })?;
            match checkpoint.status {
                CheckpointStatus::Completed => {}
                CheckpointStatus::Planned => {
                    self.prepare(config, &retry, table, &mut checkpoint).await?;
                }
                _ => self.target.create_table(table).await?,
            }
            plan.push((table, checkpoint));
        }
        Ok(plan)
    }

    /// Create the target table and count the source for a planned collection.
    async fn prepare(
        &self,
        config: &MigrationConfig,
        retry: &Retry<'_>,
        table: &'static TableDefinition,
        checkpoint: &mut MigrationCheckpoint,
    ) -> MigrateResult<()> {
        self.target.create_table(table).await?;

        let filter = SourceFilter::new(config.date_range, table.date_field);
        let total = retry
            .run("count_documents", || self.source.count_documents(table.collection, &filter))
            .await?;
        checkpoint.total_documents = total;
        checkpoint.status = CheckpointStatus::Pending;
        checkpoint.last_update = Utc::now();
        self.repository.save_checkpoint(checkpoint).await?;
        debug!(collection = table.collection, total, "Planned collection");
        Ok(())
    }

    async fn migrate_collection(
        &self,
        ctx: &RunContext<'_>,
        table: &'static TableDefinition,
        mut checkpoint: MigrationCheckpoint,
    ) -> CollectionOutcome {
        let started = Instant::now();
        let mut stats = CollectionStatistics::new(table, &checkpoint);
        let id = checkpoint.id.clone();

        if checkpoint.status == CheckpointStatus::Completed {
            info!(collection = table.collection, "Collection already completed, skipping");
            return CollectionOutcome {
                stats,
                checkpoint_id: id,
                error: None,
            };
        }

        info!(
            collection = table.collection,
            table = table.table,
            total = checkpoint.total_documents,
            resumed_from = checkpoint.documents_processed,
            "Migrating collection"
        );
        let outcome = self.copy_batches(ctx, table, &mut checkpoint, &mut stats).await;
        stats.duration = started.elapsed();

        let mut error = match outcome {
            Ok(()) => {
                checkpoint.status = CheckpointStatus::Completed;
                None
            }
            Err(MigrationError::Cancelled) => {
                checkpoint.status = CheckpointStatus::Cancelled;
                Some(MigrationError::Cancelled)
            }
            Err(err) => {
                checkpoint.status = CheckpointStatus::Failed;
                Some(err)
            }
        };
        checkpoint.last_update = Utc::now();
        if let Err(save_err) = self.repository.save_checkpoint(&checkpoint).await {
            error!(checkpoint_id = %id, error = %save_err, "Failed to persist final checkpoint");
            error.get_or_insert(save_err);
        }
        self.record_progress(ctx, &checkpoint).await;
        stats.status = checkpoint.status;

        let migration_id = checkpoint.migration_id.as_str();
        match &error {
            None => {
                if checkpoint.documents_processed > checkpoint.total_documents {
                    warn!(
                        collection = table.collection,
                        processed = checkpoint.documents_processed,
                        total = checkpoint.total_documents,
                        "Source grew during migration"
                    );
                }
                info!(
                    collection = table.collection,
                    processed = stats.documents_processed,
                    skipped = stats.documents_skipped,
                    duration_ms = stats.duration.as_millis() as u64,
                    "Collection completed"
                );
                self.log(
                    MigrationLog::info(migration_id, "Collection completed")
                        .with("collection", table.collection)
                        .with("documents_processed", checkpoint.documents_processed),
                )
                .await;
            }
            Some(MigrationError::Cancelled) => {
                warn!(
                    collection = table.collection,
                    processed = checkpoint.documents_processed,
                    "Collection cancelled"
                );
                self.log(
                    MigrationLog::failure(migration_id, "Collection cancelled", &MigrationError::Cancelled)
                        .with("collection", table.collection)
                        .with("checkpoint_id", id.as_str()),
                )
                .await;
            }
            Some(err) => {
                error!(collection = table.collection, error = %err, "Collection failed");
                self.log(
                    MigrationLog::failure(migration_id, "Collection failed", err)
                        .with("collection", table.collection)
                        .with("checkpoint_id", id.as_str()),
                )
                .await;
            }
        }

        CollectionOutcome {
            stats,
            checkpoint_id: id,
            error,
        }
    }

    async fn copy_batches(
        &self,
        ctx: &RunContext<'_>,
        table: &'static TableDefinition,
        checkpoint: &mut MigrationCheckpoint,
        stats: &mut CollectionStatistics,
    ) -> MigrateResult<()> {
        let config = ctx.config;
        let filter = SourceFilter::new(config.date_range, table.date_field);
        let policy = if config.skip_duplicates {
            ConflictPolicy::SkipDuplicates
        } else {
            ConflictPolicy::Fail
        };
        let options = TransformOptions::new().preserve_null_properties(config.preserve_null_properties);
        let retry = Retry::new(&config.retry, ctx.cancel).count_into(&ctx.retries);

        let mut data = checkpoint.data();
        if data.position.is_none() {
            data.position = checkpoint.position();
        }
        checkpoint.status = CheckpointStatus::InProgress;
        checkpoint.last_update = Utc::now();
        self.repository.save_checkpoint(checkpoint).await?;

        let mut estimate = config.batch_size.saturating_mul(INITIAL_DOCUMENT_ESTIMATE);
        let mut unflushed = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let mut permit = ctx.budget.acquire(estimate, ctx.cancel).await?;
            let request = BatchRequest {
                after: data.position.clone(),
                limit: config.batch_size,
                filter,
            };
            let documents = retry
                .run("fetch_batch", || self.source.fetch_batch(table.collection, &request))
                .await?;
            if documents.is_empty() {
                break;
            }
            let position = documents.last().and_then(SourcePosition::of);
            if position.is_none() {
                let id = documents
                    .last()
                    .and_then(|d| d.get("_id"))
                    .map(|id| format!("{:?}", id.element_type()))
                    .unwrap_or_else(|| "missing".to_string());
                return Err(MigrationError::validation(format!(
                    "'{}' has an _id of type {id} that the cursor cannot page over",
                    table.collection
                )));
            }
            if position == data.position {
                return Err(MigrationError::other(format!(
                    "cursor of '{}' did not advance",
                    table.collection
                )));
            }

            let (records, failures) = self.transformer.transform_batch(table, &documents, &options);
            let bytes: usize = records.iter().map(TargetRecord::estimated_size).sum();
            permit.resize(bytes);
            estimate = bytes.max(1);

            if !failures.is_empty() {
                self.absorb_failures(ctx, table, &failures).await?;
            }
            let outcome = if records.is_empty() {
                Default::default()
            } else {
                retry
                    .run("insert_batch", || self.target.insert_batch(table, &records, policy))
                    .await?
            };
            drop(permit);
            data.position = position;

            let handled = documents.len() as u64;
            let failed = failures.len() as u64;
            data.batches += 1;
            data.failed += failed;
            data.duplicates += outcome.skipped_duplicates;
            checkpoint.documents_processed += handled;
            checkpoint.documents_skipped += outcome.skipped_duplicates + failed;
            stats.documents_processed += handled;
            stats.documents_inserted += outcome.inserted;
            stats.documents_skipped += outcome.skipped_duplicates;
            stats.documents_failed += failed;
            stats.batches += 1;
            checkpoint.set_data(&data)?;

            debug!(
                collection = table.collection,
                batch = data.batches,
                inserted = outcome.inserted,
                duplicates = outcome.skipped_duplicates,
                failed,
                processed = checkpoint.documents_processed,
                "Batch written"
            );

            unflushed += 1;
            if unflushed >= config.checkpoint_interval {
                unflushed = 0;
                checkpoint.last_update = Utc::now();
                let current: &MigrationCheckpoint = checkpoint;
                retry
                    .run("save_checkpoint", || self.repository.save_checkpoint(current))
                    .await?;
                self.record_progress(ctx, checkpoint).await;
            }
        }

        if checkpoint.documents_processed < checkpoint.total_documents {
            let current = retry
                .run("count_documents", || self.source.count_documents(table.collection, &filter))
                .await?;
            if checkpoint.documents_processed < current {
                return Err(MigrationError::validation(format!(
                    "'{}' ended after {} of {} documents",
                    table.collection, checkpoint.documents_processed, current
                )));
            }
            warn!(
                collection = table.collection,
                planned = checkpoint.total_documents,
                current,
                "Source shrank during migration"
            );
            checkpoint.total_documents = checkpoint.documents_processed;
        }
        Ok(())
    }

    async fn absorb_failures(
        &self,
        ctx: &RunContext<'_>,
        table: &TableDefinition,
        failures: &[TransformFailure],
    ) -> MigrateResult<()> {
        let migration_id = ctx.config.migration_id.as_str();
        for failure in failures {
            warn!(collection = table.collection, id = %failure.id, error = %failure.error, "Document failed transformation");
            self.log(
                MigrationLog::failure(migration_id, "Document failed transformation", &failure.error)
                    .with("collection", table.collection)
                    .with("document_id", failure.id.as_str()),
            )
            .await;
        }

        let n = failures.len() as u64;
        let used = ctx.skipped_failures.fetch_add(n, Ordering::SeqCst) + n;
        if used > ctx.config.max_skipped_documents {
            ctx.skipped_failures.fetch_sub(n, Ordering::SeqCst);
            let first = &failures[0];
            return Err(MigrationError::transformation(
                first.id.clone(),
                format!(
                    "{} (skip budget of {} documents exhausted)",
                    first.error, ctx.config.max_skipped_documents
                ),
            ));
        }
        Ok(())
    }

    async fn record_progress(&self, ctx: &RunContext<'_>, checkpoint: &MigrationCheckpoint) {
        let points = ctx.progress.lock().update(
            &checkpoint.migration_id,
            &checkpoint.collection_name,
            checkpoint.documents_processed,
        );
        for point in points {
            match self.repository.save_rollback_point(&point).await {
                Ok(()) => {
                    debug!(name = %point.name, sequence = point.sequence, "Rollback point recorded");
                    self.log(
                        MigrationLog::info(&point.migration_id, "Rollback point recorded")
                            .with("name", point.name.as_str())
                            .with("sequence", point.sequence),
                    )
                    .await;
                }
                Err(err) => warn!(name = %point.name, error = %err, "Failed to record rollback point"),
            }
        }
    }

    async fn build_indexes(
        &self,
        config: &MigrationConfig,
        collections: &[String],
        cancel: &CancellationToken,
    ) -> MigrateResult<IndexReport> {
        let introspection = SchemaIntrospectionService::new(Arc::clone(&self.source));
        let optimizer = IndexOptimizationService::new(Arc::clone(&self.target));
        let analyses = introspection.analyze_all(collections, config.sample_size).await?;
        let mut report = IndexReport {
            recommended: optimizer.analyze_and_recommend(&analyses),
            deferred: config.defer_index_creation,
            ..IndexReport::default()
        };

        if config.defer_index_creation {
            info!(count = report.recommended.len(), "Index creation deferred");
            return Ok(report);
        }

        if config.drop_existing_indexes {
            let tables: Vec<&str> = collections
                .iter()
                .filter_map(|c| table_for_collection(c))
                .map(|t| t.table)
                .collect();
            report.dropped = optimizer
                .drop_existing_indexes(&tables, &IndexDropOptions::default())
                .await?;
        }

        let options =
            IndexCreationOptions::new().max_concurrent_creations(config.max_concurrent_indexes);
        report.created = optimizer
            .create_indexes(&report.recommended, &options, cancel)
            .await?;
        info!(
            created = report.created.len() - report.failed_count(),
            failed = report.failed_count(),
            "Index phase finished"
        );
        Ok(report)
    }

    async fn log(&self, entry: MigrationLog) {
        if let Err(err) = self.repository.append_log(&entry).await {
            warn!(migration_id = %entry.migration_id, error = %err, "Failed to persist log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCheckpointRepository, InMemorySource, InMemoryTarget};
    use crate::retry::RetryPolicy;
    use bson::{Bson, Document, doc};
    use pretty_assertions::assert_eq;

    fn entries(n: i64) -> Vec<Document> {
        (0..n)
            .map(|i| doc! { "_id": i, "type": "sgv", "sgv": 100 + (i % 50), "date": 1_700_000_000_000_i64 + i * 300_000, "device": "xdrip" })
            .collect()
    }

    fn engine(source: InMemorySource) -> (MigrationEngine, Arc<InMemoryTarget>, Arc<InMemoryCheckpointRepository>) {
        let target = Arc::new(InMemoryTarget::new());
        let repo = Arc::new(InMemoryCheckpointRepository::new());
        let engine = MigrationEngine::new(Arc::new(source), target.clone(), repo.clone());
        (engine, target, repo)
    }

    fn config() -> MigrationConfig {
        MigrationConfig::new()
            .migration_id("test-run")
            .batch_size(10)
            .skip_index_creation(true)
            .retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_migrate_all_collections() {
        let source = InMemorySource::new("care")
            .with_collection("entries", entries(35))
            .with_collection("food", vec![doc! { "_id": "f1", "name": "apple", "carbs": 14 }])
            .with_collection("unmapped", vec![doc! { "_id": 1 }]);
        let (engine, target, repo) = engine(source);

        let result = engine.migrate(&config(), &CancellationToken::new()).await.unwrap();
        assert!(result.is_success, "{:?}", result.error_message);
        assert_eq!(result.statistics.documents_processed, 36);
        assert_eq!(result.collections.len(), 2);
        assert_eq!(target.row_count("entries"), 35);
        assert_eq!(target.row_count("foods"), 1);

        let status = engine.status("test-run").await.unwrap();
        assert_eq!(status.state, MigrationState::Completed);
        assert_eq!(status.documents_processed, 36);
        assert!(repo.list_logs("test-run").await.unwrap().iter().any(|l| l.message == "Migration completed"));
    }

    #[tokio::test]
    async fn test_rollback_points_every_quarter() {
        let (engine, _, repo) = engine(InMemorySource::new("care").with_collection("entries", entries(100)));
        let config = config().checkpoint_interval(1);
        engine.migrate(&config, &CancellationToken::new()).await.unwrap();

        let names: Vec<String> = repo
            .list_rollback_points("test-run")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["progress-25", "progress-50", "progress-75", "progress-100"]);
    }

    #[tokio::test]
    async fn test_duplicate_without_skip_fails_and_with_skip_succeeds() {
        let (engine, target, _) = engine(InMemorySource::new("care").with_collection("entries", entries(20)));
        let first = engine.migrate(&config(), &CancellationToken::new()).await.unwrap();
        assert!(first.is_success);

        // Same rows again under a new migration id: original_id collides.
        let again = config().migration_id("second");
        let failed = engine.migrate(&again, &CancellationToken::new()).await.unwrap();
        assert!(!failed.is_success);
        assert_eq!(failed.error_kind, Some(ErrorKind::DuplicateKey));
        assert_eq!(failed.checkpoint_id.as_deref(), Some("second/entries"));

        let skipping = config().migration_id("third").skip_duplicates(true);
        let ok = engine.migrate(&skipping, &CancellationToken::new()).await.unwrap();
        assert!(ok.is_success);
        assert_eq!(ok.statistics.documents_skipped, 20);
        assert_eq!(target.row_count("entries"), 20);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let source = InMemorySource::new("care").with_collection("entries", entries(5));
        source.fail_next_fetches(2);
        let (engine, target, _) = engine(source);
        let config = config().retry(RetryPolicy::new().initial_delay(Duration::from_millis(1)));

        let result = engine.migrate(&config, &CancellationToken::new()).await.unwrap();
        assert!(result.is_success);
        assert_eq!(result.statistics.retries, 2);
        assert_eq!(target.row_count("entries"), 5);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_partial_result() {
        let (engine, target, repo) =
            engine(InMemorySource::new("care").with_collection("entries", entries(30)));
        let config = config().checkpoint_interval(1);
        target.fail_next_writes(u32::MAX);

        let result = engine.migrate(&config, &CancellationToken::new()).await.unwrap();
        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::Transient));
        assert_eq!(result.checkpoint_id.as_deref(), Some("test-run/entries"));

        let checkpoint = repo.get_checkpoint("test-run/entries").await.unwrap().unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Failed);
        assert_eq!(checkpoint.documents_processed, 0);
        assert_eq!(target.row_count("entries"), 0);
    }

    #[tokio::test]
    async fn test_transformation_failures_within_budget() {
        let mut docs = entries(10);
        docs.push(doc! { "_id": 10, "type": "sgv", "sgv": "not a number", "date": 1_700_000_000_000_i64 });

        let (strict_engine, strict_target, _) =
            engine(InMemorySource::new("care").with_collection("entries", docs.clone()));
        let strict = strict_engine.migrate(&config(), &CancellationToken::new()).await.unwrap();
        assert!(!strict.is_success);
        assert_eq!(strict.error_kind, Some(ErrorKind::Transformation));
        assert_eq!(strict_target.row_count("entries"), 10);

        let (lenient_engine, lenient_target, _) =
            engine(InMemorySource::new("care").with_collection("entries", docs));
        let lenient = lenient_engine
            .migrate(&config().max_skipped_documents(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(lenient.is_success);
        assert_eq!(lenient.statistics.documents_failed, 1);
        assert_eq!(lenient_target.row_count("entries"), 10);
    }

    #[tokio::test]
    async fn test_failed_planning_resumes_every_collection() {
        let source = InMemorySource::new("care")
            .with_collection("entries", entries(20))
            .with_collection("food", vec![doc! { "_id": "f1", "name": "apple", "carbs": 14 }]);
        source.fail_next_counts("food", 1);
        let (engine, target, repo) = engine(source);

        let first = engine.migrate(&config(), &CancellationToken::new()).await.unwrap();
        assert!(!first.is_success);
        assert_eq!(first.error_kind, Some(ErrorKind::Connectivity));
        assert_eq!(first.checkpoint_id.as_deref(), Some("test-run/entries"));
        let food = repo.get_checkpoint("test-run/food").await.unwrap().unwrap();
        assert_eq!(food.status, CheckpointStatus::Planned);
        assert_eq!(
            engine.status("test-run").await.unwrap().state,
            MigrationState::Interrupted
        );

        let resumed = engine
            .resume(&config(), "test-run", &CancellationToken::new())
            .await
            .unwrap();
        assert!(resumed.is_success, "{:?}", resumed.error_message);
        assert_eq!(resumed.collections.len(), 2);
        assert_eq!(target.row_count("entries"), 20);
        assert_eq!(target.row_count("foods"), 1);

        let status = engine.status("test-run").await.unwrap();
        assert_eq!(status.state, MigrationState::Completed);
        assert_eq!(status.total_documents, 21);
    }

    #[tokio::test]
    async fn test_mixed_id_types_are_all_copied() {
        let oid = bson::oid::ObjectId::new();
        let food: Vec<Document> = vec![
            Bson::Int32(1),
            Bson::Int64(2),
            Bson::Double(2.5),
            Bson::String("apple".into()),
            Bson::ObjectId(oid),
            Bson::Boolean(true),
        ]
        .into_iter()
        .map(|id| doc! { "_id": id, "name": "item" })
        .collect();
        let (engine, target, repo) = engine(InMemorySource::new("care").with_collection("food", food));

        let result = engine
            .migrate(&config().batch_size(2), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_success, "{:?}", result.error_message);
        assert_eq!(target.row_count("foods"), 6);
        let checkpoint = repo.get_checkpoint("test-run/food").await.unwrap().unwrap();
        assert_eq!(checkpoint.documents_processed, 6);
        assert_eq!(checkpoint.last_processed_id.as_deref(), Some("true"));
    }

    /// Reports more documents than it returns, like a cursor that skips a
    /// range of `_id`s.
    struct Overcounting(InMemorySource);

    #[async_trait::async_trait]
    impl DocumentSource for Overcounting {
        async fn ping(&self) -> MigrateResult<()> {
            self.0.ping().await
        }

        async fn server_info(&self) -> MigrateResult<crate::store::ServerInfo> {
            self.0.server_info().await
        }

        fn database_name(&self) -> &str {
            self.0.database_name()
        }

        async fn list_collections(&self) -> MigrateResult<Vec<String>> {
            self.0.list_collections().await
        }

        async fn count_documents(&self, collection: &str, filter: &SourceFilter) -> MigrateResult<u64> {
            Ok(self.0.count_documents(collection, filter).await? + 1)
        }

        async fn fetch_batch(
            &self,
            collection: &str,
            request: &BatchRequest,
        ) -> MigrateResult<Vec<Document>> {
            self.0.fetch_batch(collection, request).await
        }

        async fn sample_documents(&self, collection: &str, size: usize) -> MigrateResult<Vec<Document>> {
            self.0.sample_documents(collection, size).await
        }

        async fn list_indexes(&self, collection: &str) -> MigrateResult<Vec<crate::store::SourceIndex>> {
            self.0.list_indexes(collection).await
        }
    }

    #[tokio::test]
    async fn test_short_collection_is_not_completed() {
        let source = Overcounting(InMemorySource::new("care").with_collection("entries", entries(5)));
        let target = Arc::new(InMemoryTarget::new());
        let repo = Arc::new(InMemoryCheckpointRepository::new());
        let engine = MigrationEngine::new(Arc::new(source), target.clone(), repo.clone());

        let result = engine.migrate(&config(), &CancellationToken::new()).await.unwrap();
        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
        assert!(result.error_message.unwrap().contains("ended after 5 of 6 documents"));

        let checkpoint = repo.get_checkpoint("test-run/entries").await.unwrap().unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Failed);
        assert_eq!(
            engine.status("test-run").await.unwrap().state,
            MigrationState::Failed
        );
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected() {
        let (engine, _, repo) = engine(InMemorySource::new("care").with_collection("entries", entries(5)));
        let _held = repo.acquire_lock("test-run").await.unwrap();
        let result = engine.migrate(&config(), &CancellationToken::new()).await.unwrap();
        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_invalid_config_raises() {
        let (engine, _, _) = engine(InMemorySource::new("care"));
        let err = engine
            .migrate(&config().batch_size(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_resume_unknown_checkpoint() {
        let (engine, _, _) = engine(InMemorySource::new("care"));
        let result = engine
            .resume(&config(), "missing/entries", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_success);
        assert_eq!(result.migration_id, "missing");
    }

    #[test]
    fn test_progress_tracker_crosses_several_thresholds() {
        let mut checkpoint = MigrationCheckpoint::new("m", "entries", 200);
        checkpoint.documents_processed = 60;
        let mut tracker = ProgressTracker::new(25, &[checkpoint], 1);
        assert_eq!(tracker.reached, 25);

        let points = tracker.update("m", "entries", 200);
        let names: Vec<&str> = points.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["progress-50", "progress-75", "progress-100"]);
        assert_eq!(points[0].sequence, 2);
        assert!(tracker.update("m", "entries", 200).is_empty());
    }
}
