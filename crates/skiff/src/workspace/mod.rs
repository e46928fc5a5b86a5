//! Workspaces: scratch databases where a directory's statements are run so
//! that the resulting schema can be introspected.
//!
//! Three kinds exist:
//!
//! - [`WorkspaceKind::TempSchema`] creates a scratch database on a live
//!   server, guarded by an advisory lock so concurrent runs don't share it.
//! - [`WorkspaceKind::Sandbox`] does the same inside a local docker container
//!   running the `postgres` image. The container outlives the workspace;
//!   stopping it is deferred to the [`ShutdownRegistry`].
//! - [`WorkspaceKind::Prefab`] hands back a workspace the caller built.
//!
//! Every workspace must be cleaned up exactly once.
//! [`exec_logical_schema`] takes care of that.

mod exec;
mod sandbox;
mod temp_schema;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use skiff_db_schema::{ObjectKey, Schema, SourceLocation};
use tracing::info;

use crate::fs::{Dir, LogicalSchema, Statement};
use crate::instance::{Instance, SessionParams};
use crate::shutdown::ShutdownRegistry;
use crate::traced::TracedPool;
use crate::{BoxFuture, Error, Result};

pub use exec::exec_logical_schema;
pub use sandbox::{Sandbox, container_name_for_image};
pub use temp_schema::TempSchema;

/// Scratch database name used when none is configured.
pub const DEFAULT_TEMP_SCHEMA: &str = "_skiff_tmp";

/// How long to wait for another run's workspace lock by default.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// A scratch database.
pub trait Workspace: Send + Sync {
    /// Connections to the scratch database with `params` laid over the
    /// workspace defaults.
    fn connection_pool<'a>(&'a self, params: &'a SessionParams)
    -> BoxFuture<'a, Result<TracedPool>>;

    /// Read back the current schema of the scratch database.
    fn introspect_schema(&self) -> BoxFuture<'_, Result<Schema>>;

    /// Tear down. Must be called exactly once; later calls return an error.
    fn cleanup(&self) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceKind {
    TempSchema,
    Sandbox,
    Prefab,
}

impl fmt::Display for WorkspaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceKind::TempSchema => write!(f, "temp-schema"),
            WorkspaceKind::Sandbox => write!(f, "docker"),
            WorkspaceKind::Prefab => write!(f, "prefab"),
        }
    }
}

/// What happens to the workspace's resources afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupAction {
    /// Leave everything in place
    #[default]
    None,
    /// Drop the scratch database (temp-schema only)
    DropSchema,
    /// Stop the container at shutdown (sandbox only)
    StopSandbox,
    /// Remove the container at shutdown (sandbox only)
    DestroySandbox,
}

/// Everything needed to build a workspace.
///
/// Fields are tagged by the kind that uses them; setting one on a workspace
/// of another kind is rejected by [`new_workspace`].
#[derive(Clone)]
pub struct Options {
    pub kind: WorkspaceKind,
    pub cleanup_action: CleanupAction,
    /// Temp-schema: the server to create the scratch database on
    pub instance: Option<Arc<Instance>>,
    /// Sandbox: image to run, e.g. `postgres:16`
    pub image: Option<String>,
    /// Sandbox: container name; derived from the image when unset
    pub container_name: Option<String>,
    /// Sandbox: session settings for every workspace connection
    pub default_conn_params: SessionParams,
    /// Sandbox: superuser password for a newly created container
    pub root_password: Option<String>,
    pub schema_name: String,
    pub default_charset: Option<String>,
    pub default_collation: Option<String>,
    pub lock_wait_timeout: Duration,
    /// Prefab: the workspace to hand back
    pub prefab: Option<Arc<dyn Workspace>>,
    /// Sandbox: where container teardown gets registered
    pub shutdown: Option<Arc<ShutdownRegistry>>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("kind", &self.kind)
            .field("cleanup_action", &self.cleanup_action)
            .field("instance", &self.instance.as_ref().map(|i| i.to_string()))
            .field("image", &self.image)
            .field("container_name", &self.container_name)
            .field("schema_name", &self.schema_name)
            .field("lock_wait_timeout", &self.lock_wait_timeout)
            .finish_non_exhaustive()
    }
}

impl Options {
    fn base(kind: WorkspaceKind) -> Self {
        Self {
            kind,
            cleanup_action: CleanupAction::None,
            instance: None,
            image: None,
            container_name: None,
            default_conn_params: SessionParams::new(),
            root_password: None,
            schema_name: DEFAULT_TEMP_SCHEMA.to_string(),
            default_charset: None,
            default_collation: None,
            lock_wait_timeout: DEFAULT_LOCK_WAIT,
            prefab: None,
            shutdown: None,
        }
    }

    /// A scratch database on `instance`, dropped afterwards.
    pub fn temp_schema(instance: Arc<Instance>) -> Self {
        Self {
            instance: Some(instance),
            cleanup_action: CleanupAction::DropSchema,
            ..Self::base(WorkspaceKind::TempSchema)
        }
    }

    /// A scratch database in a container running `image`.
    pub fn sandbox(image: impl Into<String>, shutdown: Arc<ShutdownRegistry>) -> Self {
        Self {
            image: Some(image.into()),
            shutdown: Some(shutdown),
            ..Self::base(WorkspaceKind::Sandbox)
        }
    }

    pub fn prefab(workspace: Arc<dyn Workspace>) -> Self {
        Self {
            prefab: Some(workspace),
            ..Self::base(WorkspaceKind::Prefab)
        }
    }

    /// Reject options that do not belong to `kind`, or missing required ones.
    pub fn validate(&self) -> Result<()> {
        let mut misplaced = Vec::new();
        let mut check = |set: bool, field: &'static str, allowed: &[WorkspaceKind]| {
            if set && !allowed.contains(&self.kind) {
                misplaced.push(field);
            }
        };
        check(self.instance.is_some(), "instance", &[WorkspaceKind::TempSchema]);
        check(self.image.is_some(), "image", &[WorkspaceKind::Sandbox]);
        check(self.container_name.is_some(), "container_name", &[WorkspaceKind::Sandbox]);
        check(
            !self.default_conn_params.is_empty(),
            "default_conn_params",
            &[WorkspaceKind::Sandbox],
        );
        check(self.root_password.is_some(), "root_password", &[WorkspaceKind::Sandbox]);
        check(self.prefab.is_some(), "prefab", &[WorkspaceKind::Prefab]);
        check(self.shutdown.is_some(), "shutdown", &[WorkspaceKind::Sandbox]);
        if !misplaced.is_empty() {
            return Err(Error::Config(format!(
                "{} workspace does not take: {}",
                self.kind,
                misplaced.join(", ")
            )));
        }

        let cleanup_ok = match self.kind {
            WorkspaceKind::TempSchema => matches!(
                self.cleanup_action,
                CleanupAction::None | CleanupAction::DropSchema
            ),
            WorkspaceKind::Sandbox => matches!(
                self.cleanup_action,
                CleanupAction::None | CleanupAction::StopSandbox | CleanupAction::DestroySandbox
            ),
            WorkspaceKind::Prefab => self.cleanup_action == CleanupAction::None,
        };
        if !cleanup_ok {
            return Err(Error::Config(format!(
                "cleanup action {:?} is not valid for a {} workspace",
                self.cleanup_action, self.kind
            )));
        }

        let missing = match self.kind {
            WorkspaceKind::TempSchema if self.instance.is_none() => Some("instance"),
            WorkspaceKind::Sandbox if self.image.is_none() => Some("image"),
            WorkspaceKind::Sandbox if self.shutdown.is_none() => Some("shutdown"),
            WorkspaceKind::Prefab if self.prefab.is_none() => Some("prefab"),
            _ => None,
        };
        if let Some(field) = missing {
            return Err(Error::Config(format!(
                "{} workspace requires {}",
                self.kind, field
            )));
        }
        if self.kind != WorkspaceKind::Prefab && self.schema_name.is_empty() {
            return Err(Error::Config("workspace schema name is empty".to_string()));
        }
        Ok(())
    }
}

/// Build a ready workspace of the kind `opts` asks for.
pub async fn new_workspace(opts: Options) -> Result<Arc<dyn Workspace>> {
    opts.validate()?;
    match opts.kind {
        WorkspaceKind::TempSchema => Ok(Arc::new(TempSchema::new(&opts).await?)),
        WorkspaceKind::Sandbox => Ok(Arc::new(Sandbox::new(&opts).await?)),
        WorkspaceKind::Prefab => opts
            .prefab
            .clone()
            .ok_or_else(|| Error::Config("prefab workspace requires prefab".to_string())),
    }
}

/// Workspace options from a directory's `workspace`, `temp_schema`,
/// `reuse_temp_schema`, `docker_image`, `docker_cleanup`,
/// `lock_wait_timeout` and charset options.
///
/// `instance` is the server the directory targets; a temp-schema workspace is
/// created there. A docker workspace without `docker_image` runs the official
/// image of the same major version as `instance`.
pub async fn options_for_dir(
    dir: &Dir,
    instance: Option<Arc<Instance>>,
    shutdown: Arc<ShutdownRegistry>,
) -> Result<Options> {
    let config = &dir.config;
    let kind = config.get_enum("workspace", &["temp-schema", "docker"])?;

    let mut opts = if kind == "docker" {
        let image = match (config.get("docker_image"), &instance) {
            (Some(image), _) => image.to_string(),
            (None, Some(instance)) => {
                let image = docker_image_for_version(instance.server_version().await?);
                info!(dir = %dir, image = %image, "no docker_image set, matching {}", instance);
                image
            }
            (None, None) => {
                return Err(Error::Config(format!(
                    "{}: workspace docker requires the docker_image option",
                    dir
                )));
            }
        };
        let mut opts = Options::sandbox(image, shutdown);
        opts.cleanup_action = match config
            .get_enum("docker_cleanup", &["none", "stop", "destroy"])?
            .as_str()
        {
            "stop" => CleanupAction::StopSandbox,
            "destroy" => CleanupAction::DestroySandbox,
            _ => CleanupAction::None,
        };
        opts
    } else {
        let instance = instance.ok_or_else(|| {
            Error::Config(format!(
                "{}: workspace temp-schema requires a host (or use workspace docker)",
                dir
            ))
        })?;
        let mut opts = Options::temp_schema(instance);
        if config.get_bool("reuse_temp_schema")? {
            opts.cleanup_action = CleanupAction::None;
        }
        opts
    };

    if let Some(name) = config.get("temp_schema") {
        opts.schema_name = name.to_string();
    }
    if let Some(wait) = config.get_duration("lock_wait_timeout")? {
        opts.lock_wait_timeout = wait;
    }
    opts.default_charset = config.get("default_charset").map(str::to_string);
    opts.default_collation = config.get("default_collation").map(str::to_string);
    Ok(opts)
}

/// Official `postgres` image for a `server_version_num`: `postgres:16` for
/// 16.x, `postgres:9.6` before version 10.
fn docker_image_for_version(version_num: u32) -> String {
    let major = version_num / 10000;
    if major >= 10 {
        format!("postgres:{}", major)
    } else {
        format!("postgres:{}.{}", major, version_num / 100 % 100)
    }
}

/// A statement that failed in the workspace. Not fatal: the object is
/// simply missing from the resulting schema.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementError {
    pub statement: Statement,
    pub err: String,
}

impl StatementError {
    pub fn key(&self) -> &ObjectKey {
        &self.statement.object
    }

    pub fn location(&self) -> &SourceLocation {
        &self.statement.location
    }
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.statement.location.is_known() {
            write!(f, "{}: {}", self.statement.location, self.err)
        } else {
            write!(f, "{} [Full SQL: {}]", self.err, self.statement.text)
        }
    }
}

impl std::error::Error for StatementError {}

/// The outcome of running a logical schema in a workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceSchema {
    pub schema: Schema,
    pub logical_schema: Arc<LogicalSchema>,
    pub failures: Arc<[StatementError]>,
}

impl WorkspaceSchema {
    /// The same result under another database name. Tables, routines, the
    /// logical schema and the failures are all shared, not copied.
    pub fn copy_with_name(&self, name: impl Into<String>) -> WorkspaceSchema {
        WorkspaceSchema {
            schema: self.schema.with_name(name),
            logical_schema: self.logical_schema.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Keys of the objects whose statements failed.
    pub fn failed_keys(&self) -> Vec<ObjectKey> {
        self.failures.iter().map(|f| f.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests;
