//! Live run registry and progress snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointStatus, MigrationCheckpoint};
use crate::error::{MigrateResult, MigrationError};

/// Overall state of a migration, derived from its checkpoints and the
/// in-process registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// No checkpoints exist.
    NotStarted,
    /// A run is active in this process.
    Running,
    /// Every collection completed.
    Completed,
    /// At least one collection failed.
    Failed,
    /// The last run was cancelled.
    Cancelled,
    /// Checkpoints are pending or in progress but nothing is running.
    Interrupted,
}

impl MigrationState {
    /// Derive the state from checkpoints.
    pub fn from_checkpoints(checkpoints: &[MigrationCheckpoint], running: bool) -> Self {
        if running {
            return Self::Running;
        }
        if checkpoints.is_empty() {
            return Self::NotStarted;
        }
        let any = |status| checkpoints.iter().any(|c| c.status == status);
        if checkpoints.iter().all(|c| c.status == CheckpointStatus::Completed) {
            Self::Completed
        } else if any(CheckpointStatus::Failed) {
            Self::Failed
        } else if any(CheckpointStatus::Cancelled) {
            Self::Cancelled
        } else {
            Self::Interrupted
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Which nested operation an [`ActivityStatus`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A rollback.
    Rollback,
    /// A recovery.
    Recovery,
}

/// A rollback or recovery in progress for a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityStatus {
    /// What is running, e.g. the recovery strategy name.
    pub operation: String,
    /// Current step.
    pub step: Option<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of a migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    /// Migration identity.
    pub migration_id: String,
    /// Overall state.
    pub state: MigrationState,
    /// One checkpoint per collection.
    pub collections: Vec<MigrationCheckpoint>,
    /// Sum of processed documents.
    pub documents_processed: u64,
    /// Sum of skipped documents.
    pub documents_skipped: u64,
    /// Sum of collection totals.
    pub total_documents: u64,
    /// Rollback points recorded so far.
    pub rollback_points: usize,
    /// Active rollback, if any.
    pub rollback: Option<ActivityStatus>,
    /// Active recovery, if any.
    pub recovery: Option<ActivityStatus>,
    /// Most recent checkpoint update.
    pub last_update: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    /// Overall progress, 0..=100.
    pub fn progress_percent(&self) -> f64 {
        if self.total_documents == 0 {
            return if self.state == MigrationState::Completed { 100.0 } else { 0.0 };
        }
        (self.documents_processed.min(self.total_documents) as f64 / self.total_documents as f64)
            * 100.0
    }
}

#[derive(Debug, Default)]
struct Entry {
    running: bool,
    activities: HashMap<ActivityKind, ActivityStatus>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        !self.running && self.activities.is_empty()
    }
}

/// Tracks runs and nested operations active in this process.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl StatusRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a run active. Fails if the same migration id is already running.
    pub fn begin_run(self: &Arc<Self>, migration_id: &str) -> MigrateResult<RunGuard> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(migration_id.to_string()).or_default();
        if entry.running {
            return Err(MigrationError::AlreadyRunning(migration_id.to_string()));
        }
        entry.running = true;
        Ok(RunGuard {
            registry: Arc::clone(self),
            migration_id: migration_id.to_string(),
        })
    }

    /// Whether a run is active.
    pub fn is_running(&self, migration_id: &str) -> bool {
        self.entries
            .lock()
            .get(migration_id)
            .is_some_and(|e| e.running)
    }

    /// Record a nested operation until the guard is dropped.
    pub fn track(
        self: &Arc<Self>,
        migration_id: &str,
        kind: ActivityKind,
        operation: impl Into<String>,
    ) -> ActivityGuard {
        self.entries
            .lock()
            .entry(migration_id.to_string())
            .or_default()
            .activities
            .insert(
                kind,
                ActivityStatus {
                    operation: operation.into(),
                    step: None,
                    started_at: Utc::now(),
                },
            );
        ActivityGuard {
            registry: Arc::clone(self),
            migration_id: migration_id.to_string(),
            kind,
        }
    }

    /// The active nested operation of a kind.
    pub fn activity(&self, migration_id: &str, kind: ActivityKind) -> Option<ActivityStatus> {
        self.entries
            .lock()
            .get(migration_id)
            .and_then(|e| e.activities.get(&kind).cloned())
    }

    fn release(&self, migration_id: &str, update: impl FnOnce(&mut Entry)) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(migration_id) {
            update(entry);
            if entry.is_empty() {
                entries.remove(migration_id);
            }
        }
    }
}

/// Marks a run active while alive.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<StatusRegistry>,
    migration_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry
            .release(&self.migration_id, |entry| entry.running = false);
    }
}

/// Marks a rollback or recovery active while alive.
#[derive(Debug)]
pub struct ActivityGuard {
    registry: Arc<StatusRegistry>,
    migration_id: String,
    kind: ActivityKind,
}

impl ActivityGuard {
    /// Report the current step.
    pub fn step(&self, step: impl Into<String>) {
        if let Some(activity) = self
            .registry
            .entries
            .lock()
            .get_mut(&self.migration_id)
            .and_then(|e| e.activities.get_mut(&self.kind))
        {
            activity.step = Some(step.into());
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let kind = self.kind;
        self.registry.release(&self.migration_id, |entry| {
            entry.activities.remove(&kind);
        });
    }
}
