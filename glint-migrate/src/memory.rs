//! In-process implementations of the store and repository traits.
//!
//! They behave like the real stores where the engine can observe it: `_id`
//! ordering, date filters, unique `original_id`, atomic batches, and
//! per-migration locks. Fault injection hooks let tests simulate outages,
//! transient errors and cancellation at an exact batch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use bson::{Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    CheckpointRepository, MigrationCheckpoint, MigrationLock, MigrationLog, RecoveryAttempt,
    RollbackPoint, ensure_monotonic,
};
use crate::error::{MigrateResult, MigrationError};
use crate::index::IndexStrategy;
use crate::schema::{DateEncoding, DateField, SqlValue, TableDefinition, TargetRecord};
use crate::store::{
    BatchRequest, BatchWriteOutcome, ConflictPolicy, DocumentSource, ExistingColumn,
    RelationalTarget, ServerInfo, SourceFilter, SourceIndex, SourcePosition, TargetIndex,
};
use crate::transform::parse_date_string;

fn document_date(document: &Document, field: &DateField) -> Option<DateTime<Utc>> {
    match (document.get(field.field)?, field.encoding) {
        (Bson::DateTime(dt), _) => Some(dt.to_chrono()),
        (Bson::Int64(ms), DateEncoding::EpochMillis) => Utc.timestamp_millis_opt(*ms).single(),
        (Bson::Int32(ms), DateEncoding::EpochMillis) => {
            Utc.timestamp_millis_opt(i64::from(*ms)).single()
        }
        (Bson::Double(ms), DateEncoding::EpochMillis) => {
            Utc.timestamp_millis_opt(*ms as i64).single()
        }
        (Bson::String(s), _) => parse_date_string(s).ok(),
        _ => None,
    }
}

fn matches_filter(document: &Document, filter: &SourceFilter) -> bool {
    if !filter.date_range.is_bounded() {
        return true;
    }
    match &filter.date_field {
        None => true,
        Some(field) => document_date(document, field).is_some_and(|d| filter.date_range.contains(d)),
    }
}

/// Document store held in memory.
#[derive(Debug, Default)]
pub struct InMemorySource {
    database: String,
    collections: RwLock<BTreeMap<String, Vec<(SourcePosition, Document)>>>,
    indexes: RwLock<HashMap<String, Vec<SourceIndex>>>,
    unreachable: AtomicBool,
    failing_fetches: AtomicU32,
    failing_counts: Mutex<HashMap<String, u32>>,
}

impl InMemorySource {
    /// Create an empty database.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Add documents to a collection (builder form).
    pub fn with_collection(self, name: &str, documents: Vec<Document>) -> Self {
        self.insert(name, documents);
        self
    }

    /// Add documents to a collection. Documents without a usable `_id` are
    /// ignored.
    pub fn insert(&self, name: &str, documents: Vec<Document>) {
        let mut collections = self.collections.write();
        let collection = collections.entry(name.to_string()).or_default();
        for document in documents {
            if let Some(position) = SourcePosition::of(&document) {
                collection.push((position, document));
            }
        }
        collection.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// Define indexes on a collection.
    pub fn set_indexes(&self, collection: &str, indexes: Vec<SourceIndex>) {
        self.indexes.write().insert(collection.to_string(), indexes);
    }

    /// Make every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `n` fetches with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` counts of one collection with a connection error.
    pub fn fail_next_counts(&self, collection: &str, n: u32) {
        self.failing_counts.lock().insert(collection.to_string(), n);
    }

    fn check_reachable(&self) -> MigrateResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(MigrationError::connection("source unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl DocumentSource for InMemorySource {
    async fn ping(&self) -> MigrateResult<()> {
        self.check_reachable()
    }

    async fn server_info(&self) -> MigrateResult<ServerInfo> {
        self.check_reachable()?;
        Ok(ServerInfo {
            product: "in-memory document store".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    async fn list_collections(&self) -> MigrateResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self.collections.read().keys().cloned().collect())
    }

    async fn count_documents(&self, collection: &str, filter: &SourceFilter) -> MigrateResult<u64> {
        self.check_reachable()?;
        if let Some(n) = self.failing_counts.lock().get_mut(collection) {
            if *n > 0 {
                *n -= 1;
                return Err(MigrationError::connection("source lost"));
            }
        }
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|docs| docs.iter().filter(|(_, d)| matches_filter(d, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn fetch_batch(
        &self,
        collection: &str,
        request: &BatchRequest,
    ) -> MigrateResult<Vec<Document>> {
        self.check_reachable()?;
        if self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MigrationError::transient("simulated fetch timeout"));
        }

        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        // Same semantics as the store's cursor query, bracket by bracket.
        Ok(docs
            .iter()
            .filter(|(pos, _)| request.after.as_ref().is_none_or(|after| pos.follows(after)))
            .filter(|(_, d)| matches_filter(d, &request.filter))
            .take(request.limit)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn sample_documents(&self, collection: &str, size: usize) -> MigrateResult<Vec<Document>> {
        self.check_reachable()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|docs| docs.iter().take(size).map(|(_, d)| d.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_indexes(&self, collection: &str) -> MigrateResult<Vec<SourceIndex>> {
        self.check_reachable()?;
        Ok(self.indexes.read().get(collection).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct MemTable {
    columns: Vec<ExistingColumn>,
    rows: BTreeMap<String, Vec<SqlValue>>,
}

/// Relational store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTarget {
    tables: RwLock<BTreeMap<String, MemTable>>,
    indexes: RwLock<BTreeMap<String, TargetIndex>>,
    unreachable: AtomicBool,
    failing_writes: AtomicU32,
    broken_writes: AtomicBool,
    writes: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    fail_after: Mutex<Option<(usize, u32)>>,
    locked_tables: Mutex<HashSet<String>>,
    created_indexes: Mutex<Vec<String>>,
}

impl InMemoryTarget {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `n` batch writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail every batch write with a resource error until cleared.
    pub fn set_writes_broken(&self, broken: bool) {
        self.broken_writes.store(broken, Ordering::SeqCst);
    }

    /// Cancel `token` once `n` batch writes have succeeded.
    pub fn cancel_after_writes(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some((self.writes.load(Ordering::SeqCst) + n, token));
    }

    /// Let `n` more batch writes succeed, then fail the following
    /// `failures` writes with a transient error.
    pub fn fail_writes_after(&self, n: usize, failures: u32) {
        *self.fail_after.lock() = Some((self.writes.load(Ordering::SeqCst) + n, failures));
    }

    /// Make dropping `table` fail as if another session held a lock on it.
    pub fn lock_table(&self, table: &str) {
        self.locked_tables.lock().insert(table.to_string());
    }

    /// Successful batch writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Create a table with arbitrary columns.
    pub fn create_raw_table(&self, name: &str, columns: &[(&str, &str)]) {
        self.tables.write().insert(
            name.to_string(),
            MemTable {
                columns: columns
                    .iter()
                    .map(|(n, t)| ExistingColumn {
                        name: n.to_string(),
                        data_type: t.to_string(),
                        nullable: true,
                    })
                    .collect(),
                rows: BTreeMap::new(),
            },
        );
    }

    /// Rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// `original_id` values in a table, sorted.
    pub fn original_ids(&self, table: &str) -> Vec<String> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// A row by `original_id`, in column order.
    pub fn row(&self, table: &str, original_id: &str) -> Option<Vec<SqlValue>> {
        self.tables.read().get(table)?.rows.get(original_id).cloned()
    }

    /// Names of tables.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Names of indexes created through [`RelationalTarget::create_index`], in order.
    pub fn created_indexes(&self) -> Vec<String> {
        self.created_indexes.lock().clone()
    }

    fn check_reachable(&self) -> MigrateResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(MigrationError::connection("target unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl RelationalTarget for InMemoryTarget {
    async fn ping(&self) -> MigrateResult<()> {
        self.check_reachable()
    }

    async fn server_info(&self) -> MigrateResult<ServerInfo> {
        self.check_reachable()?;
        Ok(ServerInfo {
            product: "in-memory relational store".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn table_exists(&self, table: &str) -> MigrateResult<bool> {
        self.check_reachable()?;
        Ok(self.tables.read().contains_key(table))
    }

    async fn describe_table(&self, table: &str) -> MigrateResult<Vec<ExistingColumn>> {
        self.check_reachable()?;
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn create_table(&self, definition: &TableDefinition) -> MigrateResult<()> {
        self.check_reachable()?;
        let mut tables = self.tables.write();
        if tables.contains_key(definition.table) {
            return Ok(());
        }
        let columns = definition
            .column_names()
            .into_iter()
            .filter_map(|name| {
                definition.column_type(name).map(|ty| ExistingColumn {
                    name: name.to_string(),
                    data_type: ty.sql().to_ascii_lowercase(),
                    nullable: name != "id" && name != crate::schema::ORIGINAL_ID,
                })
            })
            .collect();
        tables.insert(
            definition.table.to_string(),
            MemTable {
                columns,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> MigrateResult<()> {
        self.check_reachable()?;
        if self.locked_tables.lock().contains(table) {
            return Err(MigrationError::transient(format!(
                "canceling statement due to lock timeout on \"{table}\""
            )));
        }
        self.tables.write().remove(table);
        self.indexes.write().retain(|_, index| index.table != table);
        Ok(())
    }

    async fn list_indexes(&self, table: &str) -> MigrateResult<Vec<TargetIndex>> {
        self.check_reachable()?;
        if !self.tables.read().contains_key(table) {
            return Ok(Vec::new());
        }
        let mut indexes = vec![
            TargetIndex {
                name: format!("{table}_pkey"),
                table: table.to_string(),
                definition: format!("CREATE UNIQUE INDEX {table}_pkey ON {table} (id)"),
                is_primary: true,
                is_constraint: true,
            },
            TargetIndex {
                name: format!("{table}_original_id_key"),
                table: table.to_string(),
                definition: format!(
                    "CREATE UNIQUE INDEX {table}_original_id_key ON {table} (original_id)"
                ),
                is_primary: false,
                is_constraint: true,
            },
        ];
        indexes.extend(
            self.indexes
                .read()
                .values()
                .filter(|i| i.table == table)
                .cloned(),
        );
        Ok(indexes)
    }

    async fn create_index(&self, strategy: &IndexStrategy) -> MigrateResult<()> {
        self.check_reachable()?;
        if !self.tables.read().contains_key(&strategy.table_name) {
            return Err(MigrationError::database(format!(
                "relation \"{}\" does not exist",
                strategy.table_name
            )));
        }
        self.indexes.write().insert(
            strategy.index_name.clone(),
            TargetIndex {
                name: strategy.index_name.clone(),
                table: strategy.table_name.clone(),
                definition: strategy.create_sql(),
                is_primary: false,
                is_constraint: false,
            },
        );
        self.created_indexes.lock().push(strategy.index_name.clone());
        Ok(())
    }

    async fn drop_index(&self, name: &str, _concurrently: bool) -> MigrateResult<()> {
        self.check_reachable()?;
        self.indexes.write().remove(name);
        Ok(())
    }

    async fn insert_batch(
        &self,
        definition: &TableDefinition,
        records: &[TargetRecord],
        policy: ConflictPolicy,
    ) -> MigrateResult<BatchWriteOutcome> {
        self.check_reachable()?;
        if self.broken_writes.load(Ordering::SeqCst) {
            return Err(MigrationError::resource_exhausted("could not extend file: no space left"));
        }
        {
            let mut fail_after = self.fail_after.lock();
            if let Some((at, failures)) = *fail_after {
                if self.writes.load(Ordering::SeqCst) >= at {
                    self.failing_writes.store(failures, Ordering::SeqCst);
                    *fail_after = None;
                }
            }
        }
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MigrationError::transient("simulated deadlock"));
        }

        let outcome = {
            let mut tables = self.tables.write();
            let table = tables.get_mut(definition.table).ok_or_else(|| {
                MigrationError::database(format!("relation \"{}\" does not exist", definition.table))
            })?;

            let mut seen = HashSet::new();
            let mut fresh = Vec::with_capacity(records.len());
            let mut outcome = BatchWriteOutcome::default();
            for record in records {
                let duplicate = table.rows.contains_key(&record.original_id)
                    || !seen.insert(record.original_id.as_str());
                if duplicate {
                    match policy {
                        ConflictPolicy::SkipDuplicates => outcome.skipped_duplicates += 1,
                        ConflictPolicy::Fail => {
                            return Err(MigrationError::duplicate_key(format!(
                                "duplicate key value violates unique constraint \
                                 \"{}_original_id_key\": ({})",
                                definition.table, record.original_id
                            )));
                        }
                    }
                } else {
                    fresh.push(record);
                }
            }
            for record in fresh {
                table.rows.insert(record.original_id.clone(), record.row());
                outcome.inserted += 1;
            }
            outcome
        };

        let writes = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = self.cancel_after.lock().as_ref() {
            if writes >= *at {
                token.cancel();
            }
        }
        Ok(outcome)
    }

    async fn count_rows(&self, table: &str) -> MigrateResult<u64> {
        self.check_reachable()?;
        Ok(self.row_count(table) as u64)
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    checkpoints: BTreeMap<String, MigrationCheckpoint>,
    logs: Vec<MigrationLog>,
    rollback_points: Vec<RollbackPoint>,
    attempts: Vec<RecoveryAttempt>,
}

/// Checkpoint repository held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointRepository {
    state: Mutex<RepositoryState>,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryCheckpointRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> MigrateResult<()> {
        let mut state = self.state.lock();
        ensure_monotonic(state.checkpoints.get(&checkpoint.id), checkpoint)?;
        state
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> MigrateResult<Option<MigrationCheckpoint>> {
        Ok(self.state.lock().checkpoints.get(id).cloned())
    }

    async fn list_checkpoints(&self, migration_id: &str) -> MigrateResult<Vec<MigrationCheckpoint>> {
        Ok(self
            .state
            .lock()
            .checkpoints
            .values()
            .filter(|c| c.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn delete_checkpoints(&self, migration_id: &str) -> MigrateResult<u64> {
        let mut state = self.state.lock();
        let before = state.checkpoints.len();
        state.checkpoints.retain(|_, c| c.migration_id != migration_id);
        Ok((before - state.checkpoints.len()) as u64)
    }

    async fn append_log(&self, log: &MigrationLog) -> MigrateResult<()> {
        self.state.lock().logs.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, migration_id: &str) -> MigrateResult<Vec<MigrationLog>> {
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|l| l.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn save_rollback_point(&self, point: &RollbackPoint) -> MigrateResult<()> {
        let mut state = self.state.lock();
        match state.rollback_points.iter_mut().find(|p| p.id == point.id) {
            Some(existing) => *existing = point.clone(),
            None => state.rollback_points.push(point.clone()),
        }
        Ok(())
    }

    async fn list_rollback_points(&self, migration_id: &str) -> MigrateResult<Vec<RollbackPoint>> {
        let mut points: Vec<RollbackPoint> = self
            .state
            .lock()
            .rollback_points
            .iter()
            .filter(|p| p.migration_id == migration_id)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.sequence);
        Ok(points)
    }

    async fn record_recovery_attempt(&self, attempt: &RecoveryAttempt) -> MigrateResult<()> {
        self.state.lock().attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_recovery_attempts(&self) -> MigrateResult<Vec<RecoveryAttempt>> {
        Ok(self.state.lock().attempts.clone())
    }

    async fn acquire_lock(&self, migration_id: &str) -> MigrateResult<MigrationLock> {
        if !self.locks.lock().insert(migration_id.to_string()) {
            return Err(MigrationError::AlreadyRunning(migration_id.to_string()));
        }
        let locks = Arc::clone(&self.locks);
        let key = migration_id.to_string();
        Ok(MigrationLock::new(migration_id, move || {
            locks.lock().remove(&key);
        }))
    }
}
