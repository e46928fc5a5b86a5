//! Named advisory locks.
//!
//! A lock is held by a session, so each [`LockHandle`] owns a dedicated
//! connection that nothing else uses. A background task pings that
//! connection to keep it from being reaped while the lock is held, and
//! unlocks when the handle is released or dropped.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::Client;
use tokio_postgres::error::SqlState;
use tracing::{debug, warn};

use crate::instance::{Instance, SessionParams};
use crate::{Error, Result};

/// How long a single `pg_advisory_lock` attempt blocks before we poll again.
const ATTEMPT_TIMEOUT: &str = "1s";

/// Interval between keep-alive pings on the lock connection.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(750);

/// A held advisory lock.
///
/// Call [`LockHandle::release`] to unlock and wait for the connection to
/// close. Dropping the handle also unlocks, without waiting.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    release_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unlock and close the lock connection.
    pub async fn release(mut self) {
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(lock = %self.name, "lock keep-alive task failed: {}", e);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // The task unlocks once it sees the signal; nobody waits for it here.
        if let Some(tx) = self.release_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Acquire the advisory lock `name` on `instance`, waiting up to `max_wait`.
///
/// Lock names are hashed with `hashtextextended`, so any string works.
pub async fn acquire_lock(instance: &Instance, name: &str, max_wait: Duration) -> Result<LockHandle> {
    let params = SessionParams::new().set("lock_timeout", ATTEMPT_TIMEOUT);
    let client = instance.connect(instance.maintenance_db(), &params).await?;

    let started = Instant::now();
    loop {
        match client
            .execute("SELECT pg_advisory_lock(hashtextextended($1, 0))", &[&name])
            .await
        {
            Ok(_) => break,
            Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                let waited = started.elapsed();
                if waited >= max_wait {
                    return Err(Error::LockTimeout {
                        name: name.to_string(),
                        waited,
                    });
                }
                debug!(lock = name, ?waited, "lock is busy, still waiting");
            }
            Err(e) => return Err(e.into()),
        }
    }
    debug!(lock = name, "acquired lock");

    let (release_tx, release_rx) = oneshot::channel();
    let task = tokio::spawn(keep_alive(client, name.to_string(), release_rx));

    Ok(LockHandle {
        name: name.to_string(),
        release_tx: Some(release_tx),
        task: Some(task),
    })
}

async fn keep_alive(client: Client, name: String, mut release: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            // a dropped sender counts as a release too
            _ = &mut release => break,
            _ = ticker.tick() => {
                if let Err(e) = client.simple_query("SELECT 1").await {
                    warn!(lock = %name, "lock released early: keep-alive ping failed: {}", e);
                    return;
                }
            }
        }
    }

    match client
        .execute("SELECT pg_advisory_unlock(hashtextextended($1, 0))", &[&name])
        .await
    {
        Ok(_) => debug!(lock = %name, "released lock"),
        Err(e) => warn!(lock = %name, "failed to release lock: {}", e),
    }
    // dropping the client closes the connection
}
