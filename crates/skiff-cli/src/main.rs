//! skiff CLI - diff and push `.sql` schema directories against Postgres.

use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use skiff::applier::{
    ApplyResult, Printer, TargetGroupQueue, run_worker_pool, sum_results, targets_for_dir,
};
use skiff::{Config, Dir, ShutdownRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Declarative schema management for Postgres")]
#[command(version)]
struct Cli {
    /// Log debug output, including why a diff is unsupported
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the DDL that would bring each database in line with DIR
    Diff(ApplyArgs),

    /// Run the DDL that brings each database in line with DIR
    Push(ApplyArgs),
}

#[derive(Args)]
struct ApplyArgs {
    /// Schema directory; subdirectories are included
    #[arg(default_value = ".")]
    dir: Utf8PathBuf,

    /// Number of servers to work on at the same time
    #[arg(long, default_value_t = 1)]
    concurrent_instances: usize,

    /// Permit statements that can destroy data
    #[arg(long)]
    allow_unsafe: bool,

    /// Only list the servers that differ (diff only)
    #[arg(long)]
    brief: bool,

    /// Check generated ALTERs in a workspace before using them
    #[arg(long)]
    verify: bool,

    /// Do not lint the objects that changed
    #[arg(long)]
    no_lint: bool,
}

impl ApplyArgs {
    /// Options that win over every `.skiff.styx` in the tree.
    fn overrides(&self, dry_run: bool) -> Config {
        let mut config = Config::new();
        config.set("dry_run", dry_run.to_string());
        config.set("brief", (self.brief && dry_run).to_string());
        config.set("lint", (!self.no_lint).to_string());
        if self.allow_unsafe {
            config.set("allow_unsafe", "true");
        }
        if self.verify {
            config.set("verify", "true");
        }
        config
    }
}

/// Everything went fine and nothing differs.
const EXIT_OK: u8 = 0;
/// Differences found (diff) or operations skipped.
const EXIT_DIFFERENCES: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    setup_logging(cli.debug);

    let (args, dry_run) = match &cli.command {
        Command::Diff(args) => (args, true),
        Command::Push(args) => (args, false),
    };

    let shutdown = Arc::new(ShutdownRegistry::new());
    let outcome = run(args, dry_run, &shutdown).await;
    shutdown.shutdown(&[]);

    match outcome {
        Ok(result) => ExitCode::from(exit_code(&result, dry_run)),
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(
    args: &ApplyArgs,
    dry_run: bool,
    shutdown: &Arc<ShutdownRegistry>,
) -> skiff::Result<ApplyResult> {
    let dir = Dir::load(&args.dir)?;
    let (groups, skipped) = targets_for_dir(&dir, &args.overrides(dry_run), shutdown).await?;
    if groups.is_empty() && skipped == 0 {
        warn!("{}: no databases to work on (set host and schema in .skiff.styx)", dir);
    }

    let cancel = setup_signal_handler();
    let printer = Arc::new(Printer::stdout(args.brief && dry_run));
    let (tx, mut rx) = mpsc::unbounded_channel();
    run_worker_pool(
        TargetGroupQueue::from_groups(groups),
        tx,
        printer,
        args.concurrent_instances,
        cancel.clone(),
    )
    .await?;

    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    let mut total = sum_results(&results);
    total.skip_count += skipped;

    if cancel.is_cancelled() {
        warn!("interrupted; some databases were not processed");
        total.skip_count += 1;
    }
    if total.skip_count > 0 {
        warn!("{} operation(s) skipped", total.skip_count);
    }
    if total.unsupported_count > 0 {
        warn!(
            "{} object(s) use features skiff cannot diff; run with --debug for details",
            total.unsupported_count
        );
    }
    info!(
        differences = total.differences,
        skipped = total.skip_count,
        unsupported = total.unsupported_count,
        "done"
    );
    Ok(total)
}

fn exit_code(result: &ApplyResult, dry_run: bool) -> u8 {
    if result.skip_count > 0 || result.unsupported_count > 0 {
        EXIT_DIFFERENCES
    } else if dry_run && result.differences {
        EXIT_DIFFERENCES
    } else {
        EXIT_OK
    }
}

fn setup_logging(debug: bool) {
    let default = if debug { "skiff=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_env("SKIFF_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

/// Cancelled on Ctrl-C: workers finish their current database and stop.
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing the current databases...");
            token.cancel();
        }
    });
    cancel
}
