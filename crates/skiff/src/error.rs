use std::time::Duration;
use thiserror::Error;

use crate::ddl::DdlError;
use crate::fs::ConfigError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fatal errors: any of these aborts the unit of work that produced it.
///
/// Per-statement failures in a workspace, unsupported diffs, lint findings
/// and failed DDL on a live database are not errors in this sense; they are
/// recorded as data and counted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("introspection of {schema} failed: {reason}")]
    Introspect { schema: String, reason: String },

    #[error("verification failed: {0}")]
    Verify(String),

    #[error("timed out after {waited:?} waiting for lock {name}")]
    LockTimeout { name: String, waited: Duration },

    #[error(transparent)]
    Ddl(#[from] DdlError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] dockside::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    pub(crate) fn workspace(msg: impl Into<String>) -> Self {
        Error::Workspace(msg.into())
    }
}
