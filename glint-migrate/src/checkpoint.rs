//! Persisted migration state: checkpoints, logs, rollback points and
//! recovery attempts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, MigrateResult, MigrationError};
use crate::recovery::FailureType;
use crate::store::SourcePosition;

/// Lifecycle of a collection checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointStatus {
    /// Recorded with the run's plan; table not prepared, source not counted.
    Planned,
    /// Created, no batch written yet.
    Pending,
    /// Batch loop running.
    InProgress,
    /// Every document processed.
    Completed,
    /// Loop exited with an error.
    Failed,
    /// Loop exited on cancellation.
    Cancelled,
}

impl CheckpointStatus {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "planned" => Self::Planned,
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Whether the batch loop has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Engine-private resume state stored in [`MigrationCheckpoint::checkpoint_data`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointData {
    /// Last document written, typed.
    pub position: Option<SourcePosition>,
    /// Batches written so far.
    pub batches: u64,
    /// Documents that failed transformation.
    pub failed: u64,
    /// Rows skipped as duplicates.
    pub duplicates: u64,
}

/// Resume position and counters for one collection of one migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    /// `"{migration_id}/{collection_name}"`.
    pub id: String,
    /// Migration identity.
    pub migration_id: String,
    /// Source collection.
    pub collection_name: String,
    /// `_id` of the last document written.
    pub last_processed_id: Option<String>,
    /// Documents read and handled (written, skipped or failed).
    pub documents_processed: u64,
    /// Documents skipped (duplicates and budgeted transformation failures).
    pub documents_skipped: u64,
    /// Documents matching the filter when the run started.
    pub total_documents: u64,
    /// When the collection loop first started.
    pub start_time: DateTime<Utc>,
    /// Last persist time.
    pub last_update: DateTime<Utc>,
    /// Current status.
    pub status: CheckpointStatus,
    /// Opaque engine state.
    pub checkpoint_data: serde_json::Value,
}

impl MigrationCheckpoint {
    /// Record a collection as part of a run's plan, before its table is
    /// prepared or its documents are counted.
    pub fn planned(migration_id: &str, collection: &str) -> Self {
        Self {
            status: CheckpointStatus::Planned,
            ..Self::new(migration_id, collection, 0)
        }
    }

    /// Create a pending checkpoint.
    pub fn new(migration_id: &str, collection: &str, total_documents: u64) -> Self {
        let now = Utc::now();
        Self {
            id: checkpoint_id(migration_id, collection),
            migration_id: migration_id.to_string(),
            collection_name: collection.to_string(),
            last_processed_id: None,
            documents_processed: 0,
            documents_skipped: 0,
            total_documents,
            start_time: now,
            last_update: now,
            status: CheckpointStatus::Pending,
            checkpoint_data: serde_json::Value::Null,
        }
    }

    /// Decode the engine state blob. Unknown or missing data yields defaults.
    pub fn data(&self) -> CheckpointData {
        serde_json::from_value(self.checkpoint_data.clone()).unwrap_or_default()
    }

    /// Encode the engine state blob and mirror the position into
    /// `last_processed_id`.
    pub fn set_data(&mut self, data: &CheckpointData) -> MigrateResult<()> {
        self.last_processed_id = data.position.as_ref().map(SourcePosition::as_string);
        self.checkpoint_data = serde_json::to_value(data)?;
        Ok(())
    }

    /// Resume position. Falls back to `last_processed_id` (ObjectId hex or
    /// plain string) when the blob carries no typed position.
    pub fn position(&self) -> Option<SourcePosition> {
        self.data().position.or_else(|| {
            self.last_processed_id.as_ref().map(|id| {
                if id.len() == 24 && id.chars().all(|c| c.is_ascii_hexdigit()) {
                    SourcePosition::ObjectId(id.clone())
                } else {
                    SourcePosition::String(id.clone())
                }
            })
        })
    }

    /// Progress in percent.
    pub fn progress_percent(&self) -> f64 {
        if self.total_documents == 0 {
            return 100.0;
        }
        (self.documents_processed as f64 / self.total_documents as f64 * 100.0).min(100.0)
    }
}

/// Build a checkpoint id.
pub fn checkpoint_id(migration_id: &str, collection: &str) -> String {
    format!("{migration_id}/{collection}")
}

/// Split a checkpoint id into migration id and collection.
pub fn parse_checkpoint_id(id: &str) -> Option<(&str, &str)> {
    let (migration, collection) = id.rsplit_once('/')?;
    if migration.is_empty() || collection.is_empty() {
        return None;
    }
    Some((migration, collection))
}

/// Log level of a persisted log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

impl LogLevel {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parse the stable string form.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLog {
    /// Migration identity.
    pub migration_id: String,
    /// Level.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Error text, when the entry records a failure.
    pub exception: Option<String>,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Structured metadata.
    pub metadata: serde_json::Value,
}

impl MigrationLog {
    /// Create a log entry.
    pub fn new(migration_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            level,
            message: message.into(),
            exception: None,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Info entry.
    pub fn info(migration_id: &str, message: impl Into<String>) -> Self {
        Self::new(migration_id, LogLevel::Info, message)
    }

    /// Warning entry.
    pub fn warn(migration_id: &str, message: impl Into<String>) -> Self {
        Self::new(migration_id, LogLevel::Warn, message)
    }

    /// Error entry carrying the error text and its classification.
    pub fn failure(migration_id: &str, message: impl Into<String>, error: &MigrationError) -> Self {
        let mut log = Self::new(migration_id, LogLevel::Error, message);
        log.exception = Some(error.to_string());
        log.with("error_kind", error.kind().as_str())
    }

    /// Attach a metadata field.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Error classification recorded in the metadata.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.metadata
            .get("error_kind")
            .and_then(|v| v.as_str())
            .and_then(ErrorKind::parse)
    }
}

/// Named marker of migration progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    /// Unique id.
    pub id: Uuid,
    /// Migration identity.
    pub migration_id: String,
    /// Name, e.g. `progress-25`.
    pub name: String,
    /// Creation order within the migration.
    pub sequence: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Processed documents per collection at creation time.
    pub progress: BTreeMap<String, u64>,
    /// Backup that restores the state at this point, if one was taken.
    pub backup_path: Option<PathBuf>,
    /// Set once a rollback has used this point.
    pub consumed: bool,
}

impl RollbackPoint {
    /// Create a point.
    pub fn new(migration_id: &str, name: impl Into<String>, sequence: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            migration_id: migration_id.to_string(),
            name: name.into(),
            sequence,
            created_at: Utc::now(),
            progress: BTreeMap::new(),
            backup_path: None,
            consumed: false,
        }
    }
}

/// One executed recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// Migration identity.
    pub migration_id: String,
    /// Strategy name.
    pub strategy: String,
    /// Classified failure the strategy was applied to.
    pub failure_type: FailureType,
    /// Whether the strategy succeeded.
    pub succeeded: bool,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
}

/// Persistence for migration state.
#[async_trait::async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Create backing tables.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Insert or update a checkpoint. Rejects a lower `documents_processed`
    /// than the stored one.
    async fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> MigrateResult<()>;

    /// Fetch a checkpoint by id.
    async fn get_checkpoint(&self, id: &str) -> MigrateResult<Option<MigrationCheckpoint>>;

    /// All checkpoints of a migration.
    async fn list_checkpoints(&self, migration_id: &str) -> MigrateResult<Vec<MigrationCheckpoint>>;

    /// Delete every checkpoint of a migration, returning how many were removed.
    async fn delete_checkpoints(&self, migration_id: &str) -> MigrateResult<u64>;

    /// Append a log entry.
    async fn append_log(&self, log: &MigrationLog) -> MigrateResult<()>;

    /// Log entries of a migration in write order.
    async fn list_logs(&self, migration_id: &str) -> MigrateResult<Vec<MigrationLog>>;

    /// Insert or update a rollback point.
    async fn save_rollback_point(&self, point: &RollbackPoint) -> MigrateResult<()>;

    /// Rollback points of a migration in sequence order.
    async fn list_rollback_points(&self, migration_id: &str) -> MigrateResult<Vec<RollbackPoint>>;

    /// Record a recovery attempt.
    async fn record_recovery_attempt(&self, attempt: &RecoveryAttempt) -> MigrateResult<()>;

    /// Recovery attempts of every migration, oldest first.
    async fn list_recovery_attempts(&self) -> MigrateResult<Vec<RecoveryAttempt>>;

    /// Take the exclusive run lock for a migration id.
    async fn acquire_lock(&self, migration_id: &str) -> MigrateResult<MigrationLock>;
}

/// Reject a checkpoint write that would move progress backwards.
pub fn ensure_monotonic(
    stored: Option<&MigrationCheckpoint>,
    incoming: &MigrationCheckpoint,
) -> MigrateResult<()> {
    match stored {
        Some(stored) if incoming.documents_processed < stored.documents_processed => {
            Err(MigrationError::validation(format!(
                "checkpoint '{}' would regress from {} to {} processed documents",
                incoming.id, stored.documents_processed, incoming.documents_processed
            )))
        }
        _ => Ok(()),
    }
}

/// Exclusive run lock for one migration id.
pub struct MigrationLock {
    migration_id: String,
    release_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl MigrationLock {
    /// Create a lock with a release callback run on drop.
    pub fn new(migration_id: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            migration_id: migration_id.into(),
            release_fn: Some(Box::new(release)),
        }
    }

    /// Migration id this lock guards.
    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }
}

impl std::fmt::Debug for MigrationLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationLock")
            .field("migration_id", &self.migration_id)
            .finish()
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Some(release) = self.release_fn.take() {
            release();
        }
    }
}

/// Stable 64-bit key for a migration id (FNV-1a), used for advisory locks.
pub fn lock_key(migration_id: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in migration_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}
