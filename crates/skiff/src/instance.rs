//! Postgres servers, connections and the [`SchemaHost`] seam used by the
//! diff-apply workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use skiff_db_schema::Schema;
use skiff_sql::{Lit, quote_ident};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::fs::Config;
use crate::traced::TracedPool;
use crate::{BoxFuture, Error, Result, introspect};

/// Upper bound on connections per pool. This is also what bounds the
/// parallelism of the CREATE phase in a workspace.
pub const MAX_POOL_SIZE: usize = 10;

/// Session settings applied to every connection of a pool.
///
/// Passed to the server through the `options` startup parameter as
/// `-c name=value` pairs, so they are in effect before the first statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SessionParams(Vec<(String, String)>);

impl SessionParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing any earlier value for `name`.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// These params overlaid with `overrides`; on conflict `overrides` wins.
    pub fn merged_with(&self, overrides: &SessionParams) -> SessionParams {
        overrides
            .iter()
            .fold(self.clone(), |acc, (n, v)| acc.set(n, v))
    }

    /// Value for the libpq `options` parameter.
    pub fn to_options(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let opts = self
            .iter()
            .map(|(n, v)| format!("-c {}={}", n, v.replace('\\', "\\\\").replace(' ', "\\ ")))
            .collect::<Vec<_>>()
            .join(" ");
        Some(opts)
    }
}

/// Where live schemas come from and where their DDL goes.
///
/// [`Instance`] is the real implementation; the worker pool only depends on
/// this trait so that it can be driven without a server.
pub trait SchemaHost: Send + Sync + fmt::Display {
    /// Introspect database `schema`, or `None` if it does not exist.
    fn fetch_schema<'a>(&'a self, schema: &'a str) -> BoxFuture<'a, Result<Option<Schema>>>;

    /// Run DDL in database `schema`.
    fn execute<'a>(&'a self, schema: &'a str, sql: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Create the empty database `schema`.
    fn create_schema<'a>(
        &'a self,
        schema: &'a str,
        charset: Option<&'a str>,
        collation: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// A Postgres server.
pub struct Instance {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    maintenance_db: String,
    pools: Mutex<HashMap<(String, SessionParams), TracedPool>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Instance {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password,
            maintenance_db: "postgres".to_string(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Build from the `host`, `port`, `user` and `password` options.
    ///
    /// Returns `None` when no host is configured. The password falls back to
    /// `PGPASSWORD`.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let Some(host) = config.get("host") else {
            return Ok(None);
        };
        let port = config.get_u64("port")?.unwrap_or(5432);
        let port = u16::try_from(port)
            .map_err(|_| Error::Config(format!("port {} is out of range", port)))?;
        let user = config.get("user").unwrap_or("postgres");
        let password = config
            .get("password")
            .map(str::to_string)
            .or_else(|| std::env::var("PGPASSWORD").ok());
        Ok(Some(Self::new(host, port, user, password)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Database used for lock connections and server-level DDL.
    pub fn maintenance_db(&self) -> &str {
        &self.maintenance_db
    }

    fn pg_config(&self, dbname: &str, params: &SessionParams) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(dbname)
            .application_name("skiff")
            .connect_timeout(Duration::from_secs(10));
        if let Some(password) = &self.password {
            config.password(password);
        }
        if let Some(options) = params.to_options() {
            config.options(&options);
        }
        config
    }

    /// Open a dedicated connection outside of any pool.
    pub async fn connect(&self, dbname: &str, params: &SessionParams) -> Result<Client> {
        let (client, connection) = self
            .pg_config(dbname, params)
            .connect(NoTls)
            .await
            .map_err(|source| Error::Connect {
                target: format!("{}/{}", self, dbname),
                source,
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection closed with error: {}", e);
            }
        });

        Ok(client)
    }

    /// Retry [`Instance::connect`] until the server answers or `timeout`
    /// elapses. Used right after a sandbox container starts.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.connect(&self.maintenance_db, &SessionParams::new()).await {
                Ok(client) => {
                    client.simple_query("SELECT 1").await?;
                    return Ok(());
                }
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!("connection attempt {} failed: {}, retrying...", attempts, e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A pooled set of connections to `dbname` with `params`, cached per
    /// (database, params) pair.
    pub fn pool(&self, dbname: &str, params: &SessionParams) -> Result<TracedPool> {
        let key = (dbname.to_string(), params.clone());
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| Error::workspace("connection pool cache poisoned"))?;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let manager = Manager::from_config(
            self.pg_config(dbname, params),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(MAX_POOL_SIZE)
            .build()
            .map_err(|e| Error::workspace(format!("cannot build pool for {}: {}", dbname, e)))?;
        let pool = TracedPool::new(pool);
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Close and forget every cached pool for `dbname`.
    fn close_pools(&self, dbname: &str) {
        if let Ok(mut pools) = self.pools.lock() {
            pools.retain(|(db, _), pool| {
                if db == dbname {
                    pool.close();
                    false
                } else {
                    true
                }
            });
        }
    }

    async fn maintenance_pool(&self) -> Result<crate::TracedObject> {
        let pool = self.pool(&self.maintenance_db, &SessionParams::new())?;
        Ok(pool.get().await?)
    }

    /// The server's `server_version_num`, e.g. `160004` for 16.4.
    pub async fn server_version(&self) -> Result<u32> {
        let conn = self.maintenance_pool().await?;
        let row = conn
            .query_one("SELECT current_setting('server_version_num')::int", &[])
            .await?;
        let version: i32 = row.get(0);
        u32::try_from(version)
            .map_err(|_| Error::workspace(format!("{}: odd server_version_num {}", self, version)))
    }

    pub async fn database_exists(&self, name: &str) -> Result<bool> {
        let conn = self.maintenance_pool().await?;
        let row = conn
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
                &[&name],
            )
            .await?;
        Ok(row.get(0))
    }

    /// `CREATE DATABASE` from `template0`, with optional encoding and
    /// collation (the collation is used for both `LC_COLLATE` and
    /// `LC_CTYPE`).
    pub async fn create_database(
        &self,
        name: &str,
        encoding: Option<&str>,
        collation: Option<&str>,
    ) -> Result<()> {
        let mut sql = format!("CREATE DATABASE {} TEMPLATE template0", quote_ident(name));
        if let Some(encoding) = encoding {
            sql.push_str(&format!(" ENCODING {}", Lit(encoding)));
        }
        if let Some(collation) = collation {
            sql.push_str(&format!(
                " LC_COLLATE {} LC_CTYPE {}",
                Lit(collation),
                Lit(collation)
            ));
        }
        let conn = self.maintenance_pool().await?;
        conn.batch_execute(&sql).await?;
        Ok(())
    }

    /// Drop `name`, terminating any sessions still connected to it.
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.close_pools(name);
        let sql = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name));
        let conn = self.maintenance_pool().await?;
        conn.batch_execute(&sql).await?;
        Ok(())
    }

    /// Whether any table in `name` holds at least one row.
    pub async fn database_has_rows(&self, name: &str) -> Result<bool> {
        let conn = self.pool(name, &SessionParams::new())?.get().await?;
        let rows = conn
            .query(
                "SELECT format('%I.%I', n.nspname, c.relname)
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relkind IN ('r', 'p')
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema')
                   AND n.nspname NOT LIKE 'pg\\_toast%'",
                &[],
            )
            .await?;
        for row in rows {
            let table: String = row.get(0);
            let sql = format!("SELECT EXISTS (SELECT 1 FROM {})", table);
            let exists: bool = conn.query_one(&sql, &[]).await?.get(0);
            if exists {
                debug!(database = name, table = %table, "table has rows");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Introspect `name` into a [`Schema`].
    pub async fn introspect(&self, name: &str) -> Result<Schema> {
        let conn = self.pool(name, &SessionParams::new())?.get().await?;
        introspect::introspect_schema(&conn, name).await
    }
}

impl SchemaHost for Instance {
    fn fetch_schema<'a>(&'a self, schema: &'a str) -> BoxFuture<'a, Result<Option<Schema>>> {
        Box::pin(async move {
            if !self.database_exists(schema).await? {
                warn!(instance = %self, database = schema, "database does not exist yet");
                return Ok(None);
            }
            self.introspect(schema).await.map(Some)
        })
    }

    fn execute<'a>(&'a self, schema: &'a str, sql: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let conn = self.pool(schema, &SessionParams::new())?.get().await?;
            conn.batch_execute(sql).await?;
            Ok(())
        })
    }

    fn create_schema<'a>(
        &'a self,
        schema: &'a str,
        charset: Option<&'a str>,
        collation: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.create_database(schema, charset, collation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_params_merge() {
        let defaults = SessionParams::new()
            .set("statement_timeout", "0")
            .set("check_function_bodies", "on");
        let overrides = SessionParams::new().set("check_function_bodies", "off");
        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.get("check_function_bodies"), Some("off"));
        assert_eq!(merged.get("statement_timeout"), Some("0"));
        assert_eq!(merged.iter().count(), 2);
    }

    #[test]
    fn test_session_params_options() {
        assert_eq!(SessionParams::new().to_options(), None);
        let params = SessionParams::new()
            .set("check_function_bodies", "off")
            .set("search_path", "public, ext");
        assert_eq!(
            params.to_options().as_deref(),
            Some("-c check_function_bodies=off -c search_path=public,\\ ext")
        );
    }

    #[test]
    fn test_instance_display() {
        let instance = Instance::new("db.internal", 5433, "postgres", None);
        assert_eq!(instance.to_string(), "db.internal:5433");
        assert_eq!(instance.maintenance_db(), "postgres");
    }
}
