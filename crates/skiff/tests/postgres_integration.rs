//! Integration tests against real PostgreSQL.
//!
//! These tests verify that:
//! 1. Workspaces collect per-statement failures, whatever order the CREATEs
//!    are in, and run ALTERs in order
//! 2. A pushed directory diffs clean afterwards, also after ALTERs
//! 3. Advisory locks exclude each other across connections
//! 4. A docker workspace without an image follows the server's version
//!
//! Run with: SKIFF_TEST_POSTGRES=16-alpine cargo nextest run -p skiff --test postgres_integration
//!
//! Note: Requires Docker to be running. Without SKIFF_TEST_POSTGRES every
//! test returns early.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use dockside::{Container, containers};
use skiff::applier::{
    ApplyResult, Printer, TargetGroupQueue, run_worker_pool, sum_results, targets_for_dir,
};
use skiff::fs::CONFIG_FILE;
use skiff::workspace::{Options, exec_logical_schema, options_for_dir};
use skiff::{
    Config, Dir, Error, Instance, LogicalSchema, ObjectKey, SchemaDiff, SchemaHost,
    ShutdownRegistry, acquire_lock,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PASSWORD: &str = "test";

/// Start a PostgreSQL container, or `None` when the tests are not enabled.
async fn setup_postgres() -> Option<(Container, Arc<Instance>)> {
    let Ok(tag) = std::env::var("SKIFF_TEST_POSTGRES") else {
        eprintln!("SKIFF_TEST_POSTGRES not set, skipping");
        return None;
    };
    let container =
        Container::run(containers::postgres(&tag, PASSWORD)).expect("failed to start postgres");
    let port = container
        .wait_for_port(5432, Duration::from_secs(30))
        .expect("postgres port not available");

    let instance = Instance::new("127.0.0.1", port, "postgres", Some(PASSWORD.to_string()));
    instance
        .wait_until_ready(Duration::from_secs(30))
        .await
        .expect("postgres never became ready");
    Some((container, Arc::new(instance)))
}

/// A schema directory on disk, removed on drop.
struct SchemaDir(Utf8PathBuf);

impl SchemaDir {
    fn new(test: &str, instance: &Instance) -> Self {
        let path = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .expect("temp dir is not UTF-8")
            .join(format!("skiff-{}-{}", test, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        let config = format!(
            "host 127.0.0.1\nport {}\nuser postgres\npassword {}\nschema app\n",
            instance.port(),
            PASSWORD
        );
        std::fs::write(path.join(CONFIG_FILE), config).unwrap();
        Self(path)
    }

    fn path(&self) -> &Utf8Path {
        &self.0
    }

    fn write(&self, file: &str, sql: &str) {
        std::fs::write(self.0.join(file), sql).unwrap();
    }
}

impl Drop for SchemaDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Push (or with `dry_run`, diff) the directory and return the summed
/// result.
async fn push(dir: &SchemaDir, dry_run: bool) -> ApplyResult {
    let root = Dir::load(dir.path()).unwrap();
    let mut flags = Config::new();
    flags.set("dry_run", dry_run.to_string());
    flags.set("verify", "true");
    let shutdown = Arc::new(ShutdownRegistry::new());
    let (groups, skipped) = targets_for_dir(&root, &flags, &shutdown).await.unwrap();
    assert_eq!(skipped, 0);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = Arc::new(Printer::new(false, Box::new(std::io::sink()), false));
    run_worker_pool(
        TargetGroupQueue::from_groups(groups),
        tx,
        printer,
        2,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    shutdown.shutdown(&[]);
    sum_results(&results)
}

/// Live schema of `app` against what the directory describes.
async fn remaining_diff(dir: &SchemaDir, instance: &Arc<Instance>) -> SchemaDiff {
    let root = Dir::load(dir.path()).unwrap();
    let desired = exec_logical_schema(
        root.logical_schema.clone(),
        Options::temp_schema(instance.clone()),
    )
    .await
    .unwrap();
    assert!(desired.failures.is_empty(), "{:?}", desired.failures);
    let live = instance
        .fetch_schema("app")
        .await
        .unwrap()
        .expect("database app was not created");
    SchemaDiff::new(&live, &desired.schema.with_name("app"))
}

#[tokio::test]
async fn test_workspace_collects_statement_failures() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    let logical = LogicalSchema::from_sql(
        "tables.sql",
        r#"
CREATE TABLE users (id bigint PRIMARY KEY, email text NOT NULL);
CREATE TABLE broken (id no_such_type);
CREATE TABLE posts (id bigint PRIMARY KEY, author_id bigint REFERENCES users (id));
"#,
    )
    .unwrap();

    let result = exec_logical_schema(Arc::new(logical), Options::temp_schema(instance.clone()))
        .await
        .unwrap();
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].key(), &ObjectKey::table("broken"));
    assert_eq!(result.failures[0].location().line, Some(3));
    assert!(result.schema.get_table("users").is_some());
    let posts = result.schema.get_table("posts").expect("posts was created");
    assert_eq!(posts.foreign_keys.len(), 1);
    assert!(result.schema.get_table("broken").is_none());
}

#[tokio::test]
async fn test_workspace_result_does_not_depend_on_create_order() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    let users = "CREATE TABLE users (id bigint PRIMARY KEY);";
    let posts = "CREATE TABLE posts (id bigint PRIMARY KEY, author_id bigint REFERENCES users (id));";
    let comments = "CREATE TABLE comments (id bigint PRIMARY KEY, post_id bigint REFERENCES posts (id));";
    let broken = "CREATE TABLE broken (id no_such_type);";

    let mut outcomes = Vec::new();
    for order in [
        [users, posts, comments, broken],
        [comments, broken, posts, users],
    ] {
        let logical = LogicalSchema::from_sql("tables.sql", &order.join("\n")).unwrap();
        let result =
            exec_logical_schema(Arc::new(logical), Options::temp_schema(instance.clone()))
                .await
                .unwrap();
        let mut tables: Vec<_> = result.schema.tables.keys().cloned().collect();
        tables.sort();
        outcomes.push((tables, result.failed_keys()));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, vec!["comments", "posts", "users"]);
    assert_eq!(outcomes[0].1, vec![ObjectKey::table("broken")]);
}

#[tokio::test]
async fn test_workspace_runs_alters_in_order() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    // the index only works after the column exists
    let logical = LogicalSchema::from_sql(
        "tables.sql",
        r#"
CREATE TABLE events (id bigint PRIMARY KEY);
ALTER TABLE events ADD COLUMN kind text;
ALTER TABLE events ADD CONSTRAINT events_kind_key UNIQUE (kind);
"#,
    )
    .unwrap();

    let result = exec_logical_schema(Arc::new(logical), Options::temp_schema(instance))
        .await
        .unwrap();
    assert!(result.failures.is_empty(), "{:?}", result.failures);
    let events = result.schema.get_table("events").unwrap();
    assert!(events.columns.iter().any(|c| c.name == "kind"));
    assert!(events.indices.iter().any(|i| i.name == "events_kind_key"));
}

#[tokio::test]
async fn test_push_converges() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    let dir = SchemaDir::new("push-converges", &instance);
    dir.write(
        "users.sql",
        "CREATE TABLE users (id bigint GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY, email text NOT NULL);\n",
    );
    dir.write(
        "posts.sql",
        "CREATE TABLE posts (id bigint PRIMARY KEY, author_id bigint NOT NULL REFERENCES users (id) ON DELETE CASCADE, body text);\n",
    );

    // creates the database, then both tables
    let first = push(&dir, false).await;
    assert!(first.differences);
    assert_eq!(first.skip_count, 0);
    assert!(remaining_diff(&dir, &instance).await.is_empty());

    // nothing left to do
    let second = push(&dir, true).await;
    assert_eq!(second, ApplyResult::default());

    // an ALTER round, verified in a workspace first
    dir.write(
        "posts.sql",
        r#"
CREATE TABLE posts (
    id bigint PRIMARY KEY,
    author_id bigint NOT NULL REFERENCES users (id),
    body text NOT NULL DEFAULT '',
    published_at timestamptz
);
CREATE INDEX posts_author_id_idx ON posts (author_id);
"#,
    );
    let third = push(&dir, false).await;
    assert!(third.differences);
    assert_eq!(third.skip_count, 0);
    let diff = remaining_diff(&dir, &instance).await;
    assert!(diff.is_empty(), "{}", diff);
}

#[tokio::test]
async fn test_unsafe_changes_are_skipped_on_a_live_database() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    let dir = SchemaDir::new("unsafe", &instance);
    dir.write("a.sql", "CREATE TABLE a (id bigint PRIMARY KEY, note text);\n");
    assert_eq!(push(&dir, false).await.skip_count, 0);

    dir.write("a.sql", "CREATE TABLE a (id bigint PRIMARY KEY);\n");
    let result = push(&dir, false).await;
    assert!(result.differences);
    assert_eq!(result.skip_count, 1);

    let live = instance.fetch_schema("app").await.unwrap().unwrap();
    let a = live.get_table("a").unwrap();
    assert!(a.columns.iter().any(|c| c.name == "note"));
}

#[tokio::test]
async fn test_advisory_lock_excludes_other_holders() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    let held = acquire_lock(&instance, "skiff-it", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(held.name(), "skiff-it");

    let err = acquire_lock(&instance, "skiff-it", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }), "{}", err);

    // other names are independent
    let other = acquire_lock(&instance, "skiff-it-other", Duration::from_secs(1))
        .await
        .unwrap();
    other.release().await;

    held.release().await;
    let again = acquire_lock(&instance, "skiff-it", Duration::from_secs(5))
        .await
        .unwrap();
    again.release().await;
}

#[tokio::test]
async fn test_docker_workspace_matches_the_server_version() {
    let Some((_container, instance)) = setup_postgres().await else {
        return;
    };
    let version = instance.server_version().await.unwrap();
    assert!(version >= 100000, "{}", version);

    let dir = SchemaDir::new("docker-image", &instance);
    dir.write("a.sql", "CREATE TABLE a (id bigint PRIMARY KEY);\n");
    let mut root = Dir::load(dir.path()).unwrap();
    root.config.set("workspace", "docker");
    let shutdown = Arc::new(ShutdownRegistry::new());
    let opts = options_for_dir(&root, Some(instance.clone()), shutdown)
        .await
        .unwrap();
    assert_eq!(
        opts.image.as_deref(),
        Some(format!("postgres:{}", version / 10000).as_str())
    );
}
