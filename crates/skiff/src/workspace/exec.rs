use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_postgres::error::SqlState;
use tracing::{debug, warn};

use super::{Options, StatementError, Workspace, WorkspaceSchema, new_workspace};
use crate::fs::{LogicalSchema, Statement};
use crate::instance::SessionParams;
use crate::traced::TracedPool;
use crate::{Error, Result};

/// Session settings for creating functions and procedures: their bodies would
/// otherwise be validated against tables that may not exist yet.
fn routine_params() -> SessionParams {
    SessionParams::new().set("check_function_bodies", "off")
}

/// Run `logical` in a fresh workspace built from `opts` and introspect the
/// result.
///
/// CREATE statements run concurrently (bounded by the pool size); those
/// that failed because an object they reference was not there yet are
/// retried one at a time until nothing more succeeds. Then ALTER statements
/// run one at a time in order. A statement that fails is
/// recorded in [`WorkspaceSchema::failures`] and does not stop the others.
/// Failing to build the workspace, to connect to it or to introspect it is
/// fatal. The workspace is always cleaned up; a cleanup error is returned
/// only if nothing else failed first.
pub async fn exec_logical_schema(
    logical: Arc<LogicalSchema>,
    mut opts: Options,
) -> Result<WorkspaceSchema> {
    if let Some(charset) = &logical.charset {
        opts.default_charset = Some(charset.clone());
    }
    if let Some(collation) = &logical.collation {
        opts.default_collation = Some(collation.clone());
    }

    let ws = new_workspace(opts).await?;
    let result = run_statements(ws.as_ref(), &logical).await;
    let cleanup = ws.cleanup().await;

    match (result, cleanup) {
        (Ok((schema, failures)), Ok(())) => Ok(WorkspaceSchema {
            schema,
            logical_schema: logical,
            failures: failures.into(),
        }),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            warn!("workspace cleanup failed after an earlier error: {}", cleanup_err);
            Err(e)
        }
    }
}

async fn run_statements(
    ws: &dyn Workspace,
    logical: &Arc<LogicalSchema>,
) -> Result<(skiff_db_schema::Schema, Vec<StatementError>)> {
    let connect = |e: Error| Error::workspace(format!("Cannot connect to workspace: {}", e));
    let pool = ws
        .connection_pool(&SessionParams::default())
        .await
        .map_err(connect)?;
    let routine_pool = ws
        .connection_pool(&routine_params())
        .await
        .map_err(connect)?;

    let mut creates = JoinSet::new();
    for (i, stmt) in logical.creates.iter().enumerate() {
        let pool = if stmt.object.kind.is_session_sensitive() {
            routine_pool.clone()
        } else {
            pool.clone()
        };
        let logical = logical.clone();
        creates.spawn(async move {
            let stmt = &logical.creates[i];
            (i, run_statement(&pool, stmt).await)
        });
    }
    let mut create_failures = Vec::new();
    while let Some(joined) = creates.join_next().await {
        let (i, outcome) = joined?;
        if let Err(failure) = outcome {
            create_failures.push((i, failure));
        }
    }

    // a CREATE may have raced ahead of an object it references
    let (pool_ref, routine_ref, stmts) = (&pool, &routine_pool, &logical.creates);
    let mut failures = settle(create_failures, move |i| {
        let stmt: &Statement = &stmts[i];
        let pool = if stmt.object.kind.is_session_sensitive() {
            routine_ref
        } else {
            pool_ref
        };
        run_statement(pool, stmt)
    })
    .await;

    for stmt in &logical.alters {
        if let Err(failure) = run_statement(&pool, stmt).await {
            failures.push(failure.error);
        }
    }

    for failure in &failures {
        debug!("workspace statement failed: {}", failure);
    }

    let schema = ws.introspect_schema().await?;
    Ok((schema, failures))
}

/// A statement that failed, and whether it failed because an object it
/// references did not exist (yet).
#[derive(Debug)]
struct Failure {
    error: StatementError,
    missing_dependency: bool,
}

/// Retry the failures caused by a missing object one at a time, pass after
/// pass, until a pass succeeds at nothing. Returns what still fails, in
/// statement order.
async fn settle<F, Fut>(
    mut pending: Vec<(usize, Failure)>,
    mut run: F,
) -> Vec<StatementError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<(), Failure>>,
{
    pending.sort_by_key(|(i, _)| *i);
    loop {
        let mut progressed = false;
        let mut still_failing = Vec::with_capacity(pending.len());
        for (i, failure) in pending {
            if !failure.missing_dependency {
                still_failing.push((i, failure));
                continue;
            }
            match run(i).await {
                Ok(()) => {
                    debug!(statement = i, "CREATE succeeded on retry");
                    progressed = true;
                }
                Err(failure) => still_failing.push((i, failure)),
            }
        }
        pending = still_failing;
        if !progressed {
            break;
        }
    }
    pending.into_iter().map(|(_, f)| f.error).collect()
}

async fn run_statement(pool: &TracedPool, stmt: &Statement) -> Result<(), Failure> {
    let failed = |err: String, missing_dependency: bool| Failure {
        error: StatementError {
            statement: stmt.clone(),
            err,
        },
        missing_dependency,
    };
    let conn = pool
        .get()
        .await
        .map_err(|e| failed(format!("Error executing DDL in workspace: {}", e), false))?;
    conn.batch_execute(&stmt.text)
        .await
        .map_err(|e| failed(describe(&e), is_missing_dependency(&e)))
}

fn is_missing_dependency(e: &tokio_postgres::Error) -> bool {
    matches!(
        e.code(),
        Some(code) if *code == SqlState::UNDEFINED_TABLE
            || *code == SqlState::UNDEFINED_OBJECT
            || *code == SqlState::UNDEFINED_FUNCTION
    )
}

fn describe(e: &tokio_postgres::Error) -> String {
    let message = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    if e.code() == Some(&SqlState::SYNTAX_ERROR) {
        format!("SQL syntax error: {}", message)
    } else {
        format!("Error executing DDL in workspace: {}", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_db_schema::ObjectKey;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn statements() -> Arc<LogicalSchema> {
        let sql = "CREATE TABLE comments (id bigint, post_id bigint REFERENCES posts (id));
CREATE TABLE posts (id bigint PRIMARY KEY, author_id bigint REFERENCES users (id));
CREATE TABLE users (id bigint PRIMARY KEY);
CREATE TABLE broken (id no_such_type);
";
        Arc::new(LogicalSchema::from_sql("app.sql", sql).unwrap())
    }

    fn failure(logical: &LogicalSchema, i: usize, missing_dependency: bool) -> Failure {
        Failure {
            error: StatementError {
                statement: logical.creates[i].clone(),
                err: format!("statement {} failed", i),
            },
            missing_dependency,
        }
    }

    /// Each statement succeeds once everything it references was created.
    fn runner(
        logical: Arc<LogicalSchema>,
        created: Rc<RefCell<Vec<usize>>>,
        needs: &'static [(usize, usize)],
    ) -> impl FnMut(usize) -> std::pin::Pin<Box<dyn Future<Output = Result<(), Failure>>>> {
        move |i| {
            let logical = logical.clone();
            let created = created.clone();
            Box::pin(async move {
                let ready = needs
                    .iter()
                    .filter(|(stmt, _)| *stmt == i)
                    .all(|(_, dep)| created.borrow().contains(dep));
                if ready {
                    created.borrow_mut().push(i);
                    Ok(())
                } else {
                    Err(failure(&logical, i, true))
                }
            })
        }
    }

    #[tokio::test]
    async fn test_creates_that_raced_ahead_of_a_reference_are_retried() {
        let logical = statements();
        // users (2) was created concurrently; comments and posts lost the race
        let created = Rc::new(RefCell::new(vec![2]));
        let pending = vec![
            (3, failure(&logical, 3, false)),
            (0, failure(&logical, 0, true)),
            (1, failure(&logical, 1, true)),
        ];

        let remaining = settle(
            pending,
            runner(logical.clone(), created.clone(), &[(0, 1), (1, 2)]),
        )
        .await;

        // comments needed a second pass, after posts
        assert_eq!(*created.borrow(), vec![2, 1, 0]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key(), &ObjectKey::table("broken"));
    }

    #[tokio::test]
    async fn test_retry_stops_when_a_pass_makes_no_progress() {
        let logical = statements();
        let created = Rc::new(RefCell::new(Vec::new()));
        // posts and comments reference each other; neither can go first
        let pending = vec![
            (1, failure(&logical, 1, true)),
            (0, failure(&logical, 0, true)),
        ];

        let remaining = settle(
            pending,
            runner(logical.clone(), created.clone(), &[(0, 1), (1, 0)]),
        )
        .await;

        assert!(created.borrow().is_empty());
        let keys: Vec<_> = remaining.iter().map(|e| e.key().clone()).collect();
        assert_eq!(keys, vec![ObjectKey::table("comments"), ObjectKey::table("posts")]);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let logical = statements();
        let created = Rc::new(RefCell::new(Vec::new()));
        let pending = vec![(3, failure(&logical, 3, false))];

        let remaining = settle(pending, runner(logical.clone(), created.clone(), &[])).await;

        assert!(created.borrow().is_empty());
        assert_eq!(remaining[0].err, "statement 3 failed");
    }
}
