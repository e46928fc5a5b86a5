use std::sync::Arc;

use super::*;
use crate::fs::{Config, LogicalSchema};
use skiff_db_schema::{Column, Index, IndexColumn, PrimaryKey, Schema};

const SQL: &str = "CREATE TABLE events (id bigint PRIMARY KEY, score real);

CREATE TABLE audit_log (happened_at timestamptz);
";

fn index(name: &str, columns: &[&str], unique: bool) -> Index {
    Index {
        name: name.to_string(),
        columns: columns.iter().map(|c| IndexColumn::new(*c)).collect(),
        unique,
        constraint: false,
        where_clause: None,
    }
}

fn workspace_schema(events_indices: Vec<Index>) -> WorkspaceSchema {
    let mut schema = Schema::new("app");

    let mut events = Table::new("events");
    events.columns = vec![
        Column::new("id", "bigint").not_null(),
        Column::new("score", "real"),
        Column::new("kind", "text"),
    ];
    events.primary_key = Some(PrimaryKey {
        name: "events_pkey".to_string(),
        columns: vec!["id".to_string()],
    });
    events.indices = events_indices;
    schema.add_table(events);

    let mut audit = Table::new("audit_log");
    audit.columns = vec![Column::new("happened_at", "timestamp with time zone")];
    schema.add_table(audit);

    WorkspaceSchema {
        schema,
        logical_schema: Arc::new(LogicalSchema::from_sql("tables.sql", SQL).unwrap()),
        failures: Vec::new().into(),
    }
}

fn messages(result: &LintResult) -> Vec<String> {
    result.annotations.iter().map(|a| a.to_string()).collect()
}

#[test]
fn test_default_rules() {
    let ws = workspace_schema(vec![]);
    let mut result = check_schema(&ws, &LintOptions::default());
    result.sort_by_file();
    assert_eq!(
        messages(&result),
        vec!["tables.sql:3:1: [pk] table audit_log does not have a primary key"]
    );
    assert_eq!(result.warning_count, 1);
    assert_eq!(result.error_count, 0);
}

#[test]
fn test_severity_and_filters() {
    let ws = workspace_schema(vec![]);
    let opts = LintOptions {
        pk: Severity::Error,
        float: Severity::Warning,
        ..Default::default()
    };
    let mut result = check_schema(&ws, &opts);
    result.sort_by_file();
    assert_eq!(result.error_count, 1);
    assert_eq!(result.warning_count, 1);
    assert_eq!(result.annotations[0].rule, "float");
    assert_eq!(result.annotations[0].location.line, Some(1));
    assert_eq!(result.annotations[1].severity, Severity::Error);

    let only = opts.clone().only_keys([ObjectKey::table("events")]);
    assert_eq!(check_schema(&ws, &only).error_count, 0);

    let mut ignored = opts.clone();
    ignored.ignore_table = Some(Regex::new("^audit").unwrap());
    assert_eq!(check_schema(&ws, &ignored).error_count, 0);

    let mut ignored = opts;
    ignored.ignore_keys.insert(ObjectKey::table("audit_log"));
    assert!(check_schema(&ws, &ignored).annotations.iter().all(|a| a.rule != "pk"));
}

#[test]
fn test_redundant_indexes() {
    let ws = workspace_schema(vec![
        index("events_kind_idx", &["kind"], false),
        index("events_kind_score_idx", &["kind", "score"], false),
        index("events_kind_score_again", &["kind", "score"], false),
        index("events_id_key", &["id"], true),
        index("events_score_kind_key", &["score", "kind"], true),
        index("events_score_idx", &["score"], false),
    ]);
    let opts = LintOptions {
        pk: Severity::Ignore,
        ..Default::default()
    };
    let result = check_schema(&ws, &opts);
    let reported: Vec<&str> = result
        .annotations
        .iter()
        .map(|a| a.message.split(' ').nth(1).unwrap_or_default())
        .collect();
    assert_eq!(
        reported,
        vec![
            "events_kind_idx",
            "events_kind_score_again",
            "events_id_key",
            "events_score_idx",
        ]
    );
}

#[test]
fn test_partial_indexes_are_not_redundant() {
    let mut partial = index("events_kind_active", &["kind"], false);
    partial.where_clause = Some("(score > (0)::real)".to_string());
    let ws = workspace_schema(vec![
        partial,
        index("events_kind_score_idx", &["kind", "score"], false),
    ]);
    let result = check_schema(&ws, &LintOptions::default());
    assert!(result.annotations.iter().all(|a| a.rule != "dupe-index"));
}

#[test]
fn test_options_for_dir() {
    let mut config = Config::new();
    config.set("lint_pk", "ERROR");
    config.set("lint_float", "warning");
    let dir = Dir {
        path: "schema".into(),
        config,
        logical_schema: Arc::new(LogicalSchema::new()),
    };
    let opts = LintOptions::for_dir(&dir).unwrap();
    assert_eq!(opts.pk, Severity::Error);
    assert_eq!(opts.dupe_index, Severity::Warning);
    assert_eq!(opts.float, Severity::Warning);

    let mut dir = dir;
    dir.config.set("lint_dupe_index", "loud");
    assert!(LintOptions::for_dir(&dir).is_err());
}
