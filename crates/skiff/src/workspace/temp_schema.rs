use std::sync::Arc;

use skiff_db_schema::Schema;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CleanupAction, Options, Workspace};
use crate::instance::{Instance, SessionParams};
use crate::lock::{LockHandle, acquire_lock};
use crate::traced::TracedPool;
use crate::{BoxFuture, Error, Result};

/// A scratch database on a live server.
///
/// Holds the advisory lock `skiff.<name>` from creation until cleanup, so two
/// runs pointed at the same server never share the scratch database.
pub struct TempSchema {
    instance: Arc<Instance>,
    schema_name: String,
    cleanup_action: CleanupAction,
    default_params: SessionParams,
    lock: Mutex<Option<LockHandle>>,
}

impl TempSchema {
    pub(super) async fn new(opts: &Options) -> Result<Self> {
        let instance = opts
            .instance
            .clone()
            .ok_or_else(|| Error::Config("temp-schema workspace requires instance".to_string()))?;
        Self::provision(instance, opts, opts.cleanup_action, SessionParams::new()).await
    }

    /// Lock, clear out and (re)create the scratch database on `instance`.
    pub(super) async fn provision(
        instance: Arc<Instance>,
        opts: &Options,
        cleanup_action: CleanupAction,
        default_params: SessionParams,
    ) -> Result<Self> {
        let name = opts.schema_name.clone();
        let lock_name = format!("skiff.{}", name);
        let lock = acquire_lock(&instance, &lock_name, opts.lock_wait_timeout).await?;

        let ws = Self {
            instance,
            schema_name: name,
            cleanup_action,
            default_params,
            lock: Mutex::new(Some(lock)),
        };
        if let Err(e) = ws.prepare(opts).await {
            if let Some(lock) = ws.lock.lock().await.take() {
                lock.release().await;
            }
            return Err(e);
        }
        Ok(ws)
    }

    async fn prepare(&self, opts: &Options) -> Result<()> {
        let name = &self.schema_name;
        if self.instance.database_exists(name).await? {
            if self.instance.database_has_rows(name).await? {
                return Err(Error::workspace(format!(
                    "refusing to use database {} on {} with data",
                    name, self.instance
                )));
            }
            debug!(database = %name, instance = %self.instance, "dropping leftover workspace database");
            self.instance.drop_database(name).await?;
        }

        self.instance
            .create_database(
                name,
                opts.default_charset.as_deref(),
                opts.default_collation.as_deref(),
            )
            .await?;
        info!(database = %name, instance = %self.instance, "created workspace database");
        Ok(())
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }
}

impl Workspace for TempSchema {
    fn connection_pool<'a>(
        &'a self,
        params: &'a SessionParams,
    ) -> BoxFuture<'a, Result<TracedPool>> {
        Box::pin(async move {
            let params = self.default_params.merged_with(params);
            self.instance.pool(&self.schema_name, &params)
        })
    }

    fn introspect_schema(&self) -> BoxFuture<'_, Result<Schema>> {
        Box::pin(self.instance.introspect(&self.schema_name))
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(lock) = self.lock.lock().await.take() else {
                return Err(Error::workspace(format!(
                    "workspace {} already cleaned up",
                    self.schema_name
                )));
            };

            let result = match self.cleanup_action {
                CleanupAction::DropSchema => {
                    debug!(database = %self.schema_name, "dropping workspace database");
                    self.instance.drop_database(&self.schema_name).await
                }
                _ => Ok(()),
            };
            lock.release().await;
            result
        })
    }
}
