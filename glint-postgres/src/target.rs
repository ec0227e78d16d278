//! [`RelationalTarget`] over a PostgreSQL pool.

use async_trait::async_trait;
use glint_migrate::index::drop_index_sql;
use glint_migrate::schema::ORIGINAL_ID;
use glint_migrate::store::{ExistingColumn, TargetIndex};
use glint_migrate::{
    BatchWriteOutcome, ConflictPolicy, IndexStrategy, MigrateResult, MigrationError,
    RelationalTarget, ServerInfo, TableDefinition, TargetRecord,
};
use tracing::{debug, info};

use crate::error::PgError;
use crate::pool::PgPool;
use crate::types::{Param, as_params, to_param};

/// Server-side limit on bind parameters per statement.
const MAX_PARAMS: usize = 65_535;

const TABLE_EXISTS_SQL: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_name = $1)";

const DESCRIBE_TABLE_SQL: &str = "SELECT column_name, data_type, is_nullable \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1 \
     ORDER BY ordinal_position";

const LIST_INDEXES_SQL: &str = "SELECT i.indexname, i.indexdef, ix.indisprimary, \
     EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid) AS is_constraint \
     FROM pg_indexes i \
     JOIN pg_namespace n ON n.nspname = i.schemaname \
     JOIN pg_class ic ON ic.relname = i.indexname AND ic.relnamespace = n.oid \
     JOIN pg_index ix ON ix.indexrelid = ic.oid \
     WHERE i.schemaname = current_schema() AND i.tablename = $1 \
     ORDER BY i.indexname";

/// Writes migrated rows into PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgTarget {
    pool: PgPool,
}

impl PgTarget {
    /// Wrap a pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The wrapped pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Multi-row `INSERT` for `rows` records of a table.
pub fn insert_sql(definition: &TableDefinition, rows: usize, policy: ConflictPolicy) -> String {
    let columns = definition.column_names();
    let width = columns.len();
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c)).collect();

    let mut values = Vec::with_capacity(rows);
    for row in 0..rows {
        let placeholders: Vec<String> = (1..=width).map(|i| format!("${}", row * width + i)).collect();
        values.push(format!("({})", placeholders.join(", ")));
    }

    let mut sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES {}",
        definition.table,
        quoted.join(", "),
        values.join(", ")
    );
    if policy == ConflictPolicy::SkipDuplicates {
        sql.push_str(&format!(" ON CONFLICT (\"{}\") DO NOTHING", ORIGINAL_ID));
    }
    sql
}

/// Records per statement so the bind parameters stay under the server limit.
pub fn rows_per_statement(definition: &TableDefinition) -> usize {
    (MAX_PARAMS / definition.column_names().len()).max(1)
}

fn record_params(definition: &TableDefinition, record: &TargetRecord) -> MigrateResult<Vec<Param>> {
    let mut params = Vec::with_capacity(record.values.len() + 3);
    for (value, column) in record.row().iter().zip(definition.column_names()) {
        let column_type = definition
            .column_type(column)
            .ok_or_else(|| PgError::type_conversion(format!("unknown column '{}'", column)))?;
        let param = to_param(value, column_type).map_err(|e| {
            MigrationError::transformation(record.original_id.clone(), e.to_string())
        })?;
        params.push(param);
    }
    Ok(params)
}

#[async_trait]
impl RelationalTarget for PgTarget {
    async fn ping(&self) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    async fn server_info(&self) -> MigrateResult<ServerInfo> {
        let conn = self.pool.get().await?;
        let row = conn.query_one("SHOW server_version", &[]).await?;
        Ok(ServerInfo {
            product: "PostgreSQL".to_string(),
            version: row.try_get::<_, String>(0).map_err(PgError::from)?,
        })
    }

    async fn table_exists(&self, table: &str) -> MigrateResult<bool> {
        let conn = self.pool.get().await?;
        let row = conn.query_one(TABLE_EXISTS_SQL, &[&table]).await?;
        Ok(row.try_get::<_, bool>(0).map_err(PgError::from)?)
    }

    async fn describe_table(&self, table: &str) -> MigrateResult<Vec<ExistingColumn>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(DESCRIBE_TABLE_SQL, &[&table]).await?;
        rows.iter()
            .map(|row| {
                Ok(ExistingColumn {
                    name: row.try_get(0).map_err(PgError::from)?,
                    data_type: row.try_get(1).map_err(PgError::from)?,
                    nullable: row.try_get::<_, String>(2).map_err(PgError::from)? == "YES",
                })
            })
            .collect()
    }

    async fn create_table(&self, definition: &TableDefinition) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&definition.create_table_sql()).await?;
        info!(table = definition.table, "Table ready");
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&format!("DROP TABLE IF EXISTS \"{}\" CASCADE;", table))
            .await?;
        info!(table, "Table dropped");
        Ok(())
    }

    async fn list_indexes(&self, table: &str) -> MigrateResult<Vec<TargetIndex>> {
        let conn = self.pool.get().await?;
        let rows = conn.query(LIST_INDEXES_SQL, &[&table]).await?;
        rows.iter()
            .map(|row| {
                Ok(TargetIndex {
                    name: row.try_get(0).map_err(PgError::from)?,
                    table: table.to_string(),
                    definition: row.try_get(1).map_err(PgError::from)?,
                    is_primary: row.try_get(2).map_err(PgError::from)?,
                    is_constraint: row.try_get(3).map_err(PgError::from)?,
                })
            })
            .collect()
    }

    async fn create_index(&self, strategy: &IndexStrategy) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&strategy.create_sql()).await?;
        Ok(())
    }

    async fn drop_index(&self, name: &str, concurrently: bool) -> MigrateResult<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&drop_index_sql(name, concurrently)).await?;
        Ok(())
    }

    async fn insert_batch(
        &self,
        definition: &TableDefinition,
        records: &[TargetRecord],
        policy: ConflictPolicy,
    ) -> MigrateResult<BatchWriteOutcome> {
        if records.is_empty() {
            return Ok(BatchWriteOutcome::default());
        }

        let mut conn = self.pool.get().await?;
        let txn = conn.transaction().await?;
        let mut inserted = 0;

        for chunk in records.chunks(rows_per_statement(definition)) {
            let mut params: Vec<Param> = Vec::new();
            for record in chunk {
                params.extend(record_params(definition, record)?);
            }
            let sql = insert_sql(definition, chunk.len(), policy);
            inserted += txn.execute_raw(&sql, &as_params(&params)).await?;
        }
        txn.commit().await?;

        let outcome = BatchWriteOutcome {
            inserted,
            skipped_duplicates: records.len() as u64 - inserted,
        };
        debug!(
            table = definition.table,
            inserted = outcome.inserted,
            skipped = outcome.skipped_duplicates,
            "Batch written"
        );
        Ok(outcome)
    }

    async fn count_rows(&self, table: &str) -> MigrateResult<u64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(&format!("SELECT COUNT(*) FROM \"{}\"", table), &[])
            .await?;
        Ok(row.try_get::<_, i64>(0).map_err(PgError::from)? as u64)
    }
}
