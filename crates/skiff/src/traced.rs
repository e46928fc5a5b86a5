//! Pooled connections whose statements show up as tracing spans.

use std::ops::Deref;

use tokio_postgres::types::ToSql;
use tokio_postgres::{Error, Row};
use tracing::Instrument;

/// A deadpool-postgres pool handing out [`TracedObject`]s.
///
/// Every statement run against a workspace or a target database goes
/// through one, so `SKIFF_LOG=skiff=debug` shows them as `db.execute` /
/// `db.query` spans.
///
/// ```ignore
/// let pool = workspace.connection_pool(&SessionParams::default()).await?;
/// let conn = pool.get().await?;
/// conn.batch_execute("CREATE TABLE users (id bigint PRIMARY KEY)").await?;
/// ```
#[derive(Clone)]
pub struct TracedPool {
    inner: deadpool_postgres::Pool,
}

impl TracedPool {
    pub fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { inner: pool }
    }

    pub async fn get(&self) -> Result<TracedObject, deadpool_postgres::PoolError> {
        let conn = self.inner.get().await?;
        Ok(TracedObject { inner: conn })
    }

    /// Refuse new checkouts; idle connections are dropped.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// A pooled connection, returned to its pool on drop.
pub struct TracedObject {
    inner: deadpool_postgres::Object,
}

impl TracedObject {
    fn client(&self) -> &tokio_postgres::Client {
        self.inner.deref()
    }

    /// Run DDL with the simple query protocol.
    ///
    /// DDL takes no parameters, and a routine body may contain anything, so
    /// nothing is prepared.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let span = tracing::debug_span!("db.execute", sql = %sql);
        self.client().batch_execute(sql).instrument(span).await
    }

    /// Catalog query returning all rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, Error> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            params = params.len(),
            rows = tracing::field::Empty,
        );
        let rows = self
            .client()
            .query(sql, params)
            .instrument(span.clone())
            .await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    pub async fn query_one(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row, Error> {
        let span = tracing::debug_span!("db.query", sql = %sql, params = params.len());
        self.client().query_one(sql, params).instrument(span).await
    }
}
