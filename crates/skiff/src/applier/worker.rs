use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ApplyResult, Printer, Target, TargetGroup, verify_diff};
use crate::ddl::{DdlError, DdlStatement, StatementModifiers};
use crate::diff::SchemaDiff;
use crate::lint::{LintOptions, Severity, check_schema};
use crate::{Error, Result};

/// The groups still waiting for a worker. Cloning gives another handle on
/// the same queue.
#[derive(Clone)]
pub struct TargetGroupQueue {
    rx: Arc<Mutex<mpsc::Receiver<TargetGroup>>>,
}

impl TargetGroupQueue {
    pub fn new(rx: mpsc::Receiver<TargetGroup>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// A closed queue holding `groups`.
    pub fn from_groups(groups: Vec<TargetGroup>) -> Self {
        let (tx, rx) = mpsc::channel(groups.len().max(1));
        for group in groups {
            // cannot fail: the receiver is alive and there is room for all
            let _ = tx.try_send(group);
        }
        Self::new(rx)
    }

    async fn next(&self) -> Option<TargetGroup> {
        self.rx.lock().await.recv().await
    }
}

/// Take groups off `queue` until it is empty, diffing (and unless
/// `dry_run`, pushing) each of their targets in order, then send the
/// combined result on `results`.
///
/// Only fatal errors are returned; anything about a single target is logged
/// and counted in the result. When `cancel` fires the worker stops after its
/// current target and sends nothing.
pub async fn worker(
    queue: TargetGroupQueue,
    results: mpsc::UnboundedSender<ApplyResult>,
    printer: Arc<Printer>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut result = ApplyResult::default();
    loop {
        let group = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            group = queue.next() => group,
        };
        let Some(group) = group else {
            break;
        };
        for target in &group {
            apply_target(target, &printer, &mut result).await?;
            if cancel.is_cancelled() {
                return Ok(());
            }
        }
    }
    if results.send(result).is_err() {
        debug!("nobody is collecting worker results");
    }
    Ok(())
}

/// Run `workers` workers over `queue`. The first fatal error cancels the
/// others and is returned once all of them stopped.
pub async fn run_worker_pool(
    queue: TargetGroupQueue,
    results: mpsc::UnboundedSender<ApplyResult>,
    printer: Arc<Printer>,
    workers: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let mut set = JoinSet::new();
    for _ in 0..workers.max(1) {
        set.spawn(worker(
            queue.clone(),
            results.clone(),
            printer.clone(),
            cancel.clone(),
        ));
    }
    drop(results);

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let outcome = joined.map_err(Error::from).and_then(|r| r);
        if let Err(e) = outcome {
            if first_error.is_none() {
                cancel.cancel();
                first_error = Some(e);
            } else {
                debug!("additional worker error after cancellation: {}", e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn apply_target(target: &Target, printer: &Printer, result: &mut ApplyResult) -> Result<()> {
    let config = &target.dir.config;
    let host = target.host.to_string();
    let schema = target.schema_name.as_str();
    let dry_run = config.get_bool("dry_run")?;
    let brief = dry_run && config.get_bool("brief")?;

    if dry_run {
        info!("Generating diff of {} {} vs {}/*.sql", host, schema, target.dir);
    } else {
        info!("Pushing changes from {}/*.sql to {} {}", target.dir, host, schema);
    }
    let ignored = target.desired.logical_schema.ignored.len();
    if ignored > 0 {
        warn!(
            "Ignoring {} unsupported or unparseable statements found in this directory's *.sql files",
            ignored
        );
    }

    let (live, exists) = match target.live_schema().await {
        Ok(live) => live,
        Err(e) => {
            result.skip_count += 1;
            error!("Skipping {} {} for {}: {}", host, schema, target.dir, e);
            return Ok(());
        }
    };
    let diff = SchemaDiff::new(&live, target.desired_schema());

    if config.get_bool("verify")? && diff.has_table_diffs() && !brief {
        verify_diff(&diff, target).await?;
    }

    let mods = StatementModifiers::for_dir(&target.dir)?;
    let lint_opts = LintOptions::for_dir(&target.dir)?;

    let total = diff.len();
    let mut statement_count = 0;
    let mut ddls: Vec<DdlStatement> = Vec::with_capacity(total);
    for object_diff in &diff.object_diffs {
        let rendered = object_diff.statement(&mods);
        if matches!(rendered, Ok(None)) {
            continue;
        }
        statement_count += 1;
        result.differences = true;
        match rendered {
            Ok(Some(ddl)) => ddls.push(ddl),
            Ok(None) => {}
            Err(DdlError::Unsupported {
                key,
                reason,
                extended,
            }) => {
                result.unsupported_count += 1;
                warn!(
                    "Skipping {}: unable to generate DDL due to use of unsupported features ({}). Use --debug for more information.",
                    key, reason
                );
                for line in extended.lines().filter(|l| !l.is_empty()) {
                    debug!("{}", line);
                }
            }
            Err(e) => {
                result.skip_count += total;
                error!("{}", e);
                if total > 1 {
                    warn!(
                        "Skipping {} additional operations for {} {} due to previous error",
                        total - 1,
                        host,
                        schema
                    );
                }
                return Ok(());
            }
        }
    }

    if config.get_bool("lint")? {
        let lint_opts = lint_opts.only_keys(ddls.iter().map(|d| d.key.clone()));
        let mut lint = check_schema(&target.desired, &lint_opts);
        lint.sort_by_file();
        for annotation in &lint.annotations {
            match annotation.severity {
                Severity::Error => error!("{}", annotation),
                _ => warn!("{}", annotation),
            }
        }
        if lint.error_count > 0 {
            // unsupported diffs were already counted and ignored ones never run
            result.skip_count += ddls.len();
            let noun = if lint.error_count > 1 { "errors" } else { "error" };
            warn!(
                "Skipping {} {} due to {} linter {}",
                host, schema, lint.error_count, noun
            );
            return Ok(());
        }
    }

    if !exists && !dry_run && !ddls.is_empty() {
        let logical = &target.desired.logical_schema;
        let created = target
            .host
            .create_schema(
                schema,
                logical.charset.as_deref(),
                logical.collation.as_deref(),
            )
            .await;
        if let Err(e) = created {
            error!("Error creating database {} on {}: {}", schema, host, e);
            result.skip_count += ddls.len();
            return Ok(());
        }
        info!("Created database {} on {}", schema, host);
    }

    for (i, ddl) in ddls.iter().enumerate() {
        printer.print_ddl(&host, schema, ddl)?;
        if dry_run {
            continue;
        }
        if let Err(e) = execute(target, ddl).await {
            error!("Error running DDL on {} {}: {}", host, schema, e);
            let skipped = ddls.len() - i;
            result.skip_count += skipped;
            if skipped > 1 {
                warn!(
                    "Skipping {} remaining operations for {} {} due to previous error",
                    skipped - 1,
                    host,
                    schema
                );
            }
            break;
        }
    }

    if statement_count == 0 {
        info!("{} {}: No differences found", host, schema);
    } else {
        let verb = if dry_run { "diff" } else { "push" };
        info!("{} {}: {} complete", host, schema, verb);
    }
    Ok(())
}

async fn execute(target: &Target, ddl: &DdlStatement) -> Result<()> {
    for part in &ddl.parts {
        target.host.execute(&target.schema_name, part).await?;
    }
    Ok(())
}
