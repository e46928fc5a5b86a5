//! Declarative schema management for Postgres.
//!
//! The desired schema lives in `.sql` files on disk. skiff executes those
//! files in a disposable workspace database, introspects the result, diffs it
//! against the live databases of one or more servers and either prints or
//! applies the DDL needed to reconcile them.
//!
//! The pieces, leaf first:
//!
//! - [`lock`]: session-level advisory locks used to keep concurrent runs from
//!   sharing a scratch database.
//! - [`workspace`]: the scratch databases themselves (on a live server, in a
//!   docker sandbox, or supplied by the caller), plus
//!   [`workspace::exec_logical_schema`] which runs a directory's statements in
//!   one and reads back the resulting schema.
//! - [`shutdown`]: deferred teardown of sandbox containers.
//! - [`applier`]: the diff-apply worker pool.
//!
//! ```ignore
//! let dir = Dir::load("schema")?;
//! let registry = Arc::new(ShutdownRegistry::new());
//! let (groups, skipped) = targets_for_dir(&dir, &Config::new(), &registry).await?;
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod applier;
pub mod ddl;
pub mod diff;
mod error;
pub mod fs;
pub mod instance;
mod introspect;
pub mod lint;
pub mod lock;
pub mod shutdown;
mod traced;
pub mod workspace;

pub use ddl::{DdlError, DdlStatement, NextAutoInc, StatementModifiers};
pub use diff::{ObjectDiff, ObjectDiffKind, SchemaDiff, TableClause};
pub use error::{Error, Result};
pub use fs::{Config, ConfigError, Dir, LogicalSchema, Statement};
pub use instance::{Instance, SchemaHost, SessionParams};
pub use lock::{LockHandle, acquire_lock};
pub use shutdown::{ShutdownArgs, ShutdownFn, ShutdownRegistry};
pub use traced::{TracedObject, TracedPool};
pub use workspace::{
    CleanupAction, Options, StatementError, Workspace, WorkspaceKind, WorkspaceSchema,
    exec_logical_schema, new_workspace,
};

// The schema model is part of our public API
pub use skiff_db_schema::*;

/// A boxed future, used wherever a trait needs async methods and must stay
/// object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
