//! PostgreSQL connection wrapper.

use deadpool_postgres::Object;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::error::PgResult;

/// Parameter slice accepted by the query helpers.
pub type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

/// A pooled connection. Statements go through the pool's per-connection
/// prepared statement cache.
pub struct PgConnection {
    client: Object,
}

impl PgConnection {
    pub(crate) fn new(client: Object) -> Self {
        Self { client }
    }

    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: Params<'_>) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.query(&stmt, params).await?)
    }

    /// Execute a query and return exactly one row.
    pub async fn query_one(&self, sql: &str, params: Params<'_>) -> PgResult<Row> {
        debug!(sql = %sql, "Executing query_one");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.query_one(&stmt, params).await?)
    }

    /// Execute a query and return zero or one row.
    pub async fn query_opt(&self, sql: &str, params: Params<'_>) -> PgResult<Option<Row>> {
        debug!(sql = %sql, "Executing query_opt");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.query_opt(&stmt, params).await?)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: Params<'_>) -> PgResult<u64> {
        debug!(sql = %sql, "Executing statement");
        let stmt = self.client.prepare_cached(sql).await?;
        Ok(self.client.execute(&stmt, params).await?)
    }

    /// Execute one or more statements without parameters.
    pub async fn batch_execute(&self, sql: &str) -> PgResult<()> {
        debug!(sql = %sql, "Executing batch");
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    /// Begin a transaction.
    pub async fn transaction(&mut self) -> PgResult<PgTransaction<'_>> {
        debug!("Beginning transaction");
        let txn = self.client.transaction().await?;
        Ok(PgTransaction { txn })
    }

    /// Take the connection out of the pool. It is closed when dropped.
    pub(crate) fn detach(self) -> deadpool_postgres::ClientWrapper {
        Object::take(self.client)
    }
}

/// A PostgreSQL transaction. Rolled back on drop unless committed.
pub struct PgTransaction<'a> {
    txn: deadpool_postgres::Transaction<'a>,
}

impl PgTransaction<'_> {
    /// Execute a query and return zero or one row.
    pub async fn query_opt(&self, sql: &str, params: Params<'_>) -> PgResult<Option<Row>> {
        let stmt = self.txn.prepare_cached(sql).await?;
        Ok(self.txn.query_opt(&stmt, params).await?)
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: Params<'_>) -> PgResult<u64> {
        let stmt = self.txn.prepare_cached(sql).await?;
        Ok(self.txn.execute(&stmt, params).await?)
    }

    /// Execute an unprepared statement with parameters. Used for
    /// statements whose text varies per call, such as multi-row inserts.
    pub async fn execute_raw(&self, sql: &str, params: Params<'_>) -> PgResult<u64> {
        debug!(sql_len = sql.len(), params = params.len(), "Executing statement in transaction");
        Ok(self.txn.execute(sql, params).await?)
    }

    /// Commit the transaction.
    pub async fn commit(self) -> PgResult<()> {
        debug!("Committing transaction");
        self.txn.commit().await?;
        Ok(())
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> PgResult<()> {
        debug!("Rolling back transaction");
        self.txn.rollback().await?;
        Ok(())
    }
}
