use std::sync::Arc;

use indexmap::IndexMap;
use skiff_db_schema::Schema;
use tracing::{debug, error, info};

use crate::fs::{Config, Dir};
use crate::instance::{Instance, SchemaHost};
use crate::shutdown::ShutdownRegistry;
use crate::workspace::{Options, WorkspaceSchema, exec_logical_schema, options_for_dir};
use crate::Result;

/// One database to reconcile with the `.sql` files of one directory.
#[derive(Clone)]
pub struct Target {
    pub host: Arc<dyn SchemaHost>,
    pub schema_name: String,
    pub dir: Arc<Dir>,
    pub desired: WorkspaceSchema,
    /// How to build a workspace for this target; used by verification.
    pub workspace: Options,
}

/// Targets on the same server. A group is handled by a single worker, one
/// target after the other.
pub type TargetGroup = Vec<Target>;

impl Target {
    /// The current schema of the target database. A database that does not
    /// exist yet is an empty schema.
    pub async fn live_schema(&self) -> Result<(Schema, bool)> {
        match self.host.fetch_schema(&self.schema_name).await? {
            Some(schema) => Ok((schema, true)),
            None => Ok((Schema::new(self.schema_name.clone()), false)),
        }
    }

    pub fn desired_schema(&self) -> &Schema {
        &self.desired.schema
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host.to_string())
            .field("schema_name", &self.schema_name)
            .field("dir", &self.dir.path)
            .finish_non_exhaustive()
    }
}

/// Walk `dir` and its subdirectories and build the targets they describe,
/// grouped by server.
///
/// A directory names its server with `host`/`port` and its databases with
/// `schema`. Its `.sql` files are run in a workspace once, and the result is
/// shared by every database it names. When any statement fails in the
/// workspace, the directory's databases are skipped: the second value
/// returned counts them.
///
/// `overrides` (usually command-line flags) win over every option file in
/// the tree.
pub async fn targets_for_dir(
    dir: &Dir,
    overrides: &Config,
    shutdown: &Arc<ShutdownRegistry>,
) -> Result<(Vec<TargetGroup>, usize)> {
    let mut dirs = vec![dir.clone()];
    let mut i = 0;
    while i < dirs.len() {
        let subdirs = dirs[i].subdirs()?;
        dirs.extend(subdirs);
        i += 1;
    }
    for dir in &mut dirs {
        dir.config = dir.config.overlay(overrides);
    }

    let mut groups: IndexMap<String, TargetGroup> = IndexMap::new();
    let mut skipped = 0;
    for dir in dirs {
        let names = dir.schema_names();
        if names.is_empty() || dir.logical_schema.is_empty() {
            debug!(dir = %dir, "no databases or no statements, nothing to do");
            continue;
        }
        let Some(instance) = Instance::from_config(&dir.config)? else {
            debug!(dir = %dir, "no host configured, nothing to do");
            continue;
        };
        let instance = Arc::new(instance);

        let opts = options_for_dir(&dir, Some(instance.clone()), shutdown.clone()).await?;
        info!(dir = %dir, workspace = %opts.kind, "running statements in workspace");
        let desired = exec_logical_schema(dir.logical_schema.clone(), opts.clone()).await?;

        if !desired.failures.is_empty() {
            for failure in desired.failures.iter() {
                error!("{}", failure);
            }
            error!(
                "Skipping {} for {}: {} statement(s) failed in the workspace",
                names.join(", "),
                dir,
                desired.failures.len()
            );
            skipped += names.len();
            continue;
        }

        let dir = Arc::new(dir);
        let group = groups.entry(instance.to_string()).or_default();
        for name in names {
            group.push(Target {
                host: instance.clone(),
                desired: desired.copy_with_name(name.clone()),
                schema_name: name,
                dir: dir.clone(),
                workspace: opts.clone(),
            });
        }
    }

    Ok((groups.into_values().collect(), skipped))
}
