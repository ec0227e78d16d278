//! [`CheckpointRepository`] backed by PostgreSQL tables.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use glint_migrate::checkpoint::{
    CheckpointRepository, CheckpointStatus, LogLevel, MigrationCheckpoint, MigrationLock,
    MigrationLog, RecoveryAttempt, RollbackPoint, ensure_monotonic, lock_key,
};
use glint_migrate::recovery::FailureType;
use glint_migrate::{MigrateResult, MigrationError};
use tokio_postgres::Row;
use tracing::{debug, info, warn};

use crate::error::{PgError, PgResult};
use crate::pool::PgPool;

/// DDL for the state tables.
pub const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS glint_migration_checkpoints (
    id TEXT PRIMARY KEY,
    migration_id TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    last_processed_id TEXT,
    documents_processed BIGINT NOT NULL DEFAULT 0,
    documents_skipped BIGINT NOT NULL DEFAULT 0,
    total_documents BIGINT NOT NULL DEFAULT 0,
    start_time TIMESTAMPTZ NOT NULL,
    last_update TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL,
    checkpoint_data JSONB NOT NULL DEFAULT 'null'
);
CREATE INDEX IF NOT EXISTS glint_migration_checkpoints_migration_idx
    ON glint_migration_checkpoints (migration_id);

CREATE TABLE IF NOT EXISTS glint_migration_logs (
    id BIGSERIAL PRIMARY KEY,
    migration_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    exception TEXT,
    logged_at TIMESTAMPTZ NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS glint_migration_logs_migration_idx
    ON glint_migration_logs (migration_id, id);

CREATE TABLE IF NOT EXISTS glint_rollback_points (
    id UUID PRIMARY KEY,
    migration_id TEXT NOT NULL,
    name TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    progress JSONB NOT NULL DEFAULT '{}',
    backup_path TEXT,
    consumed BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS glint_rollback_points_migration_idx
    ON glint_rollback_points (migration_id, sequence);

CREATE TABLE IF NOT EXISTS glint_recovery_attempts (
    id BIGSERIAL PRIMARY KEY,
    migration_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    failure_type TEXT NOT NULL,
    succeeded BOOLEAN NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    duration_ms BIGINT NOT NULL
);
"#;

const CHECKPOINT_COLUMNS: &str = "id, migration_id, collection_name, last_processed_id, \
     documents_processed, documents_skipped, total_documents, start_time, last_update, \
     status, checkpoint_data";

const UPSERT_CHECKPOINT_SQL: &str = "INSERT INTO glint_migration_checkpoints \
     (id, migration_id, collection_name, last_processed_id, documents_processed, \
      documents_skipped, total_documents, start_time, last_update, status, checkpoint_data) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
     ON CONFLICT (id) DO UPDATE SET \
      last_processed_id = EXCLUDED.last_processed_id, \
      documents_processed = EXCLUDED.documents_processed, \
      documents_skipped = EXCLUDED.documents_skipped, \
      total_documents = EXCLUDED.total_documents, \
      last_update = EXCLUDED.last_update, \
      status = EXCLUDED.status, \
      checkpoint_data = EXCLUDED.checkpoint_data";

const INSERT_LOG_SQL: &str = "INSERT INTO glint_migration_logs \
     (migration_id, level, message, exception, logged_at, metadata) \
     VALUES ($1, $2, $3, $4, $5, $6)";

const UPSERT_ROLLBACK_POINT_SQL: &str = "INSERT INTO glint_rollback_points \
     (id, migration_id, name, sequence, created_at, progress, backup_path, consumed) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
     ON CONFLICT (id) DO UPDATE SET \
      progress = EXCLUDED.progress, \
      backup_path = EXCLUDED.backup_path, \
      consumed = EXCLUDED.consumed";

const INSERT_ATTEMPT_SQL: &str = "INSERT INTO glint_recovery_attempts \
     (migration_id, strategy, failure_type, succeeded, started_at, duration_ms) \
     VALUES ($1, $2, $3, $4, $5, $6)";

const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1)";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";

/// Checkpoints, logs, rollback points and recovery attempts in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgCheckpointRepository {
    pool: PgPool,
}

impl PgCheckpointRepository {
    /// Wrap a pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_checkpoint(row: &Row) -> PgResult<MigrationCheckpoint> {
    let status: String = row.try_get("status")?;
    Ok(MigrationCheckpoint {
        id: row.try_get("id")?,
        migration_id: row.try_get("migration_id")?,
        collection_name: row.try_get("collection_name")?,
        last_processed_id: row.try_get("last_processed_id")?,
        documents_processed: row.try_get::<_, i64>("documents_processed")? as u64,
        documents_skipped: row.try_get::<_, i64>("documents_skipped")? as u64,
        total_documents: row.try_get::<_, i64>("total_documents")? as u64,
        start_time: row.try_get("start_time")?,
        last_update: row.try_get("last_update")?,
        status: CheckpointStatus::parse(&status)
            .ok_or_else(|| PgError::query(format!("unknown checkpoint status '{}'", status)))?,
        checkpoint_data: row.try_get("checkpoint_data")?,
    })
}

fn row_to_log(row: &Row) -> PgResult<MigrationLog> {
    let level: String = row.try_get("level")?;
    Ok(MigrationLog {
        migration_id: row.try_get("migration_id")?,
        level: LogLevel::parse(&level)
            .ok_or_else(|| PgError::query(format!("unknown log level '{}'", level)))?,
        message: row.try_get("message")?,
        exception: row.try_get("exception")?,
        timestamp: row.try_get("logged_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn row_to_rollback_point(row: &Row) -> PgResult<RollbackPoint> {
    let progress: serde_json::Value = row.try_get("progress")?;
    let progress: BTreeMap<String, u64> = serde_json::from_value(progress)
        .map_err(|e| PgError::query(format!("invalid rollback point progress: {}", e)))?;
    Ok(RollbackPoint {
        id: row.try_get("id")?,
        migration_id: row.try_get("migration_id")?,
        name: row.try_get("name")?,
        sequence: row.try_get::<_, i32>("sequence")? as u32,
        created_at: row.try_get("created_at")?,
        progress,
        backup_path: row
            .try_get::<_, Option<String>>("backup_path")?
            .map(PathBuf::from),
        consumed: row.try_get("consumed")?,
    })
}

fn row_to_attempt(row: &Row) -> PgResult<RecoveryAttempt> {
    let failure_type: String = row.try_get("failure_type")?;
    Ok(RecoveryAttempt {
        migration_id: row.try_get("migration_id")?,
        strategy: row.try_get("strategy")?,
        failure_type: FailureType::parse(&failure_type).unwrap_or(FailureType::Unknown),
        succeeded: row.try_get("succeeded")?,
        started_at: row.try_get("started_at")?,
        duration_ms: row.try_get::<_, i64>("duration_ms")? as u64,
    })
}

#[async_trait]
impl CheckpointRepository for PgCheckpointRepository {
    async fn initialize(&self) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(INIT_SQL).await?;
        info!("Migration state tables ready");
        Ok(())
    }

    async fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> MigrateResult<()> {
        let mut conn = self.pool.get().await?;
        let txn = conn.transaction().await?;

        let sql = format!(
            "SELECT {} FROM glint_migration_checkpoints WHERE id = $1 FOR UPDATE",
            CHECKPOINT_COLUMNS
        );
        let stored = txn
            .query_opt(&sql, &[&checkpoint.id])
            .await?
            .map(|row| row_to_checkpoint(&row))
            .transpose()?;
        ensure_monotonic(stored.as_ref(), checkpoint)?;

        txn.execute(
            UPSERT_CHECKPOINT_SQL,
            &[
                &checkpoint.id,
                &checkpoint.migration_id,
                &checkpoint.collection_name,
                &checkpoint.last_processed_id,
                &(checkpoint.documents_processed as i64),
                &(checkpoint.documents_skipped as i64),
                &(checkpoint.total_documents as i64),
                &checkpoint.start_time,
                &checkpoint.last_update,
                &checkpoint.status.as_str(),
                &checkpoint.checkpoint_data,
            ],
        )
        .await?;
        txn.commit().await?;

        debug!(
            checkpoint = %checkpoint.id,
            processed = checkpoint.documents_processed,
            status = checkpoint.status.as_str(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> MigrateResult<Option<MigrationCheckpoint>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM glint_migration_checkpoints WHERE id = $1",
            CHECKPOINT_COLUMNS
        );
        let row = conn.query_opt(&sql, &[&id]).await?;
        Ok(row.map(|row| row_to_checkpoint(&row)).transpose()?)
    }

    async fn list_checkpoints(&self, migration_id: &str) -> MigrateResult<Vec<MigrationCheckpoint>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM glint_migration_checkpoints WHERE migration_id = $1 \
             ORDER BY collection_name",
            CHECKPOINT_COLUMNS
        );
        let rows = conn.query(&sql, &[&migration_id]).await?;
        Ok(rows
            .iter()
            .map(row_to_checkpoint)
            .collect::<PgResult<Vec<_>>>()?)
    }

    async fn delete_checkpoints(&self, migration_id: &str) -> MigrateResult<u64> {
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute(
                "DELETE FROM glint_migration_checkpoints WHERE migration_id = $1",
                &[&migration_id],
            )
            .await?;
        debug!(migration_id, deleted, "Checkpoints deleted");
        Ok(deleted)
    }

    async fn append_log(&self, log: &MigrationLog) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            INSERT_LOG_SQL,
            &[
                &log.migration_id,
                &log.level.as_str(),
                &log.message,
                &log.exception,
                &log.timestamp,
                &log.metadata,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_logs(&self, migration_id: &str) -> MigrateResult<Vec<MigrationLog>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT migration_id, level, message, exception, logged_at, metadata \
                 FROM glint_migration_logs WHERE migration_id = $1 ORDER BY id",
                &[&migration_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_log).collect::<PgResult<Vec<_>>>()?)
    }

    async fn save_rollback_point(&self, point: &RollbackPoint) -> MigrateResult<()> {
        let progress = serde_json::to_value(&point.progress)?;
        let backup_path = point
            .backup_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let conn = self.pool.get().await?;
        conn.execute(
            UPSERT_ROLLBACK_POINT_SQL,
            &[
                &point.id,
                &point.migration_id,
                &point.name,
                &(point.sequence as i32),
                &point.created_at,
                &progress,
                &backup_path,
                &point.consumed,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_rollback_points(&self, migration_id: &str) -> MigrateResult<Vec<RollbackPoint>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, migration_id, name, sequence, created_at, progress, backup_path, \
                 consumed FROM glint_rollback_points WHERE migration_id = $1 ORDER BY sequence",
                &[&migration_id],
            )
            .await?;
        Ok(rows
            .iter()
            .map(row_to_rollback_point)
            .collect::<PgResult<Vec<_>>>()?)
    }

    async fn record_recovery_attempt(&self, attempt: &RecoveryAttempt) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            INSERT_ATTEMPT_SQL,
            &[
                &attempt.migration_id,
                &attempt.strategy,
                &attempt.failure_type.as_str(),
                &attempt.succeeded,
                &attempt.started_at,
                &(attempt.duration_ms as i64),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_recovery_attempts(&self) -> MigrateResult<Vec<RecoveryAttempt>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT migration_id, strategy, failure_type, succeeded, started_at, duration_ms \
                 FROM glint_recovery_attempts ORDER BY id",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(row_to_attempt)
            .collect::<PgResult<Vec<_>>>()?)
    }

    async fn acquire_lock(&self, migration_id: &str) -> MigrateResult<MigrationLock> {
        let key = lock_key(migration_id);
        let conn = self.pool.get().await?;
        let row = conn.query_one(TRY_LOCK_SQL, &[&key]).await?;
        let acquired: bool = row.try_get(0).map_err(PgError::from)?;
        if !acquired {
            return Err(MigrationError::AlreadyRunning(migration_id.to_string()));
        }
        debug!(migration_id, key, "Advisory lock acquired");

        // The lock belongs to this session, so the connection leaves the pool
        // and is closed once the lock is released.
        let client = conn.detach();
        let id = migration_id.to_string();
        Ok(MigrationLock::new(migration_id, move || {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = client.query_one(UNLOCK_SQL, &[&key]).await {
                            warn!(migration_id = %id, error = %e, "Advisory unlock failed");
                        }
                    });
                }
                Err(_) => drop(client),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sql_creates_state_tables() {
        for table in [
            "glint_migration_checkpoints",
            "glint_migration_logs",
            "glint_rollback_points",
            "glint_recovery_attempts",
        ] {
            assert!(
                INIT_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing {}",
                table
            );
        }
    }

    #[test]
    fn test_upserts_keep_identity_columns() {
        let update = UPSERT_CHECKPOINT_SQL
            .split("DO UPDATE SET")
            .nth(1)
            .unwrap();
        assert!(!update.contains("start_time ="));
        assert!(!update.contains("migration_id ="));
        assert_eq!(UPSERT_CHECKPOINT_SQL.matches('$').count(), 11);
        assert_eq!(UPSERT_ROLLBACK_POINT_SQL.matches('$').count(), 8);
    }

    #[test]
    fn test_checkpoint_columns_match_row_mapping() {
        for column in [
            "last_processed_id",
            "documents_processed",
            "checkpoint_data",
            "status",
        ] {
            assert!(CHECKPOINT_COLUMNS.contains(column));
        }
    }
}
