use super::*;
use skiff_db_schema::{ObjectType, Table};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A workspace whose pools point at a closed port, so every statement fails
/// to get a connection, and whose introspection returns a canned schema.
struct FakeWorkspace {
    instance: Instance,
    schema: Option<Schema>,
    cleanup_fails: bool,
    cleanups: AtomicUsize,
    requested: Mutex<Vec<SessionParams>>,
}

impl FakeWorkspace {
    fn new(schema: Option<Schema>) -> Self {
        Self {
            instance: Instance::new("127.0.0.1", 1, "postgres", None),
            schema,
            cleanup_fails: false,
            cleanups: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }
}

impl Workspace for FakeWorkspace {
    fn connection_pool<'a>(
        &'a self,
        params: &'a SessionParams,
    ) -> BoxFuture<'a, Result<TracedPool>> {
        Box::pin(async move {
            self.requested.lock().unwrap().push(params.clone());
            self.instance.pool("fake", params)
        })
    }

    fn introspect_schema(&self) -> BoxFuture<'_, Result<Schema>> {
        Box::pin(async move {
            self.schema.clone().ok_or_else(|| Error::Introspect {
                schema: "fake".to_string(),
                reason: "boom".to_string(),
            })
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.cleanups.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(Error::workspace("already cleaned up"));
            }
            if self.cleanup_fails {
                return Err(Error::workspace("cleanup failed"));
            }
            Ok(())
        })
    }
}

const SQL: &str = "CREATE TABLE users (id bigint PRIMARY KEY);
CREATE FUNCTION touch() RETURNS int LANGUAGE sql AS 'SELECT 1';
ALTER TABLE users ADD COLUMN email text;
";

fn logical() -> Arc<LogicalSchema> {
    Arc::new(LogicalSchema::from_sql("app.sql", SQL).unwrap())
}

fn canned_schema() -> Schema {
    let mut schema = Schema::new("fake");
    schema.add_table(Table::new("users"));
    schema
}

#[tokio::test]
async fn test_statement_failures_are_collected_not_fatal() {
    let fake = Arc::new(FakeWorkspace::new(Some(canned_schema())));
    let result = exec_logical_schema(logical(), Options::prefab(fake.clone()))
        .await
        .unwrap();

    assert_eq!(result.schema.tables.len(), 1);
    assert_eq!(result.failures.len(), 3);
    // creates in file order, then the alter
    assert_eq!(result.failures[0].location().line, Some(1));
    assert_eq!(result.failures[1].key().kind, ObjectType::Function);
    assert_eq!(result.failures[2].location().line, Some(3));
    assert!(
        result.failures[0]
            .err
            .starts_with("Error executing DDL in workspace:")
    );
    assert_eq!(
        result.failed_keys(),
        vec![
            ObjectKey::table("users"),
            ObjectKey::new(ObjectType::Function, "touch"),
            ObjectKey::table("users"),
        ]
    );

    assert_eq!(fake.cleanups.load(Ordering::SeqCst), 1);
    let requested = fake.requested.lock().unwrap().clone();
    assert_eq!(requested.len(), 2);
    assert!(requested[0].is_empty());
    assert_eq!(requested[1].get("check_function_bodies"), Some("off"));
}

#[tokio::test]
async fn test_introspection_failure_is_fatal_and_still_cleans_up() {
    let fake = Arc::new(FakeWorkspace::new(None));
    let err = exec_logical_schema(logical(), Options::prefab(fake.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Introspect { .. }));
    assert_eq!(fake.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cleanup_error_surfaces_when_nothing_else_failed() {
    let mut fake = FakeWorkspace::new(Some(canned_schema()));
    fake.cleanup_fails = true;
    let err = exec_logical_schema(logical(), Options::prefab(Arc::new(fake)))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "workspace error: cleanup failed");
}

#[tokio::test]
async fn test_earlier_error_wins_over_cleanup_error() {
    let mut fake = FakeWorkspace::new(None);
    fake.cleanup_fails = true;
    let err = exec_logical_schema(logical(), Options::prefab(Arc::new(fake)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Introspect { .. }));
}

#[tokio::test]
async fn test_second_cleanup_errors() {
    let fake = FakeWorkspace::new(Some(canned_schema()));
    fake.cleanup().await.unwrap();
    assert!(fake.cleanup().await.is_err());
}

#[test]
fn test_options_reject_fields_of_other_kinds() {
    let registry = Arc::new(ShutdownRegistry::new());
    let instance = Arc::new(Instance::new("127.0.0.1", 5432, "postgres", None));

    let mut opts = Options::temp_schema(instance.clone());
    opts.image = Some("postgres:16".to_string());
    opts.root_password = Some("x".to_string());
    let err = opts.validate().unwrap_err();
    assert_eq!(
        err.to_string(),
        "configuration error: temp-schema workspace does not take: image, root_password"
    );

    let mut opts = Options::sandbox("postgres:16", registry.clone());
    opts.instance = Some(instance.clone());
    assert!(opts.validate().is_err());

    let mut opts = Options::sandbox("postgres:16", registry);
    opts.cleanup_action = CleanupAction::DropSchema;
    assert!(opts.validate().is_err());
    opts.cleanup_action = CleanupAction::DestroySandbox;
    assert!(opts.validate().is_ok());

    let mut opts = Options::temp_schema(instance);
    opts.cleanup_action = CleanupAction::StopSandbox;
    assert!(opts.validate().is_err());

    let mut opts = Options::prefab(Arc::new(FakeWorkspace::new(None)));
    opts.prefab = None;
    assert_eq!(
        opts.validate().unwrap_err().to_string(),
        "configuration error: prefab workspace requires prefab"
    );
}

#[test]
fn test_statement_error_display() {
    let logical = logical();
    let mut err = StatementError {
        statement: logical.creates[0].clone(),
        err: "SQL syntax error: syntax error at or near \"TABEL\"".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "app.sql:1:1: SQL syntax error: syntax error at or near \"TABEL\""
    );

    err.statement.location = SourceLocation::default();
    assert_eq!(
        err.to_string(),
        "SQL syntax error: syntax error at or near \"TABEL\" [Full SQL: CREATE TABLE users (id bigint PRIMARY KEY)]"
    );
}

#[test]
fn test_copy_with_name_shares_everything() {
    let ws = WorkspaceSchema {
        schema: canned_schema(),
        logical_schema: logical(),
        failures: Vec::new().into(),
    };
    let copy = ws.copy_with_name("app_eu");
    assert_eq!(copy.schema.name, "app_eu");
    assert!(Arc::ptr_eq(&ws.logical_schema, &copy.logical_schema));
    assert!(Arc::ptr_eq(&ws.failures, &copy.failures));
    assert!(Arc::ptr_eq(
        &ws.schema.tables["users"],
        &copy.schema.tables["users"]
    ));
}

#[test]
fn test_container_name_for_image() {
    assert_eq!(
        container_name_for_image("postgres:16-alpine"),
        "skiff-postgres-16-alpine"
    );
    assert_eq!(
        container_name_for_image("ghcr.io/acme/pg:17"),
        "skiff-ghcr.io-acme-pg-17"
    );
}

fn dir_with(options: &[(&str, &str)]) -> Dir {
    let mut config = crate::fs::Config::new();
    for (key, value) in options {
        config.set(*key, *value);
    }
    Dir {
        path: "schema".into(),
        config,
        logical_schema: logical(),
    }
}

#[test]
fn test_docker_image_for_version() {
    assert_eq!(docker_image_for_version(160004), "postgres:16");
    assert_eq!(docker_image_for_version(100023), "postgres:10");
    assert_eq!(docker_image_for_version(90624), "postgres:9.6");
}

#[tokio::test]
async fn test_docker_workspace_options() {
    let registry = Arc::new(ShutdownRegistry::new());

    let dir = dir_with(&[
        ("workspace", "docker"),
        ("docker_image", "postgres:17-alpine"),
        ("docker_cleanup", "destroy"),
    ]);
    let opts = options_for_dir(&dir, None, registry.clone()).await.unwrap();
    assert_eq!(opts.kind, WorkspaceKind::Sandbox);
    assert_eq!(opts.image.as_deref(), Some("postgres:17-alpine"));
    assert_eq!(opts.cleanup_action, CleanupAction::DestroySandbox);

    // without an image there is no server to take the version from
    let dir = dir_with(&[("workspace", "docker")]);
    let err = options_for_dir(&dir, None, registry.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{}", err);

    // an unreachable server cannot tell its version
    let instance = Arc::new(Instance::new("127.0.0.1", 1, "postgres", None));
    assert!(options_for_dir(&dir, Some(instance), registry).await.is_err());
}
