use super::*;
use skiff_db_schema::{IndexColumn, ObjectType, ReferentialAction};

fn identity_column(name: &str, next: i64) -> Column {
    Column {
        identity: Some(Identity {
            always: true,
            start: 1,
            next,
        }),
        ..Column::new(name, "bigint").not_null()
    }
}

fn users() -> Table {
    let mut table = Table::new("users");
    table.columns = vec![
        identity_column("id", 1),
        Column::new("email", "text").not_null(),
        Column::new("name", "text"),
    ];
    table.primary_key = Some(PrimaryKey {
        name: "users_pkey".to_string(),
        columns: vec!["id".to_string()],
    });
    table.indices = vec![Index {
        name: "users_email_key".to_string(),
        columns: vec![IndexColumn::new("email")],
        unique: true,
        constraint: true,
        where_clause: None,
    }];
    table
}

fn posts() -> Table {
    let mut table = Table::new("posts");
    table.columns = vec![
        identity_column("id", 1),
        Column::new("author_id", "bigint").not_null(),
        Column::new("title", "text").not_null(),
    ];
    table.foreign_keys = vec![author_fk("posts_author_id_fkey")];
    table
}

fn author_fk(name: &str) -> ForeignKey {
    ForeignKey {
        name: name.to_string(),
        columns: vec!["author_id".to_string()],
        references_table: "users".to_string(),
        references_columns: vec!["id".to_string()],
        on_update: ReferentialAction::NoAction,
        on_delete: ReferentialAction::Cascade,
    }
}

fn plain_index(name: &str, column: &str) -> Index {
    Index {
        name: name.to_string(),
        columns: vec![IndexColumn::new(column)],
        unique: false,
        constraint: false,
        where_clause: None,
    }
}

fn schema(tables: Vec<Table>) -> Schema {
    let mut schema = Schema::new("app");
    for table in tables {
        schema.add_table(table);
    }
    schema
}

fn clauses(diff: &ObjectDiff) -> &[TableClause] {
    match &diff.kind {
        ObjectDiffKind::AlterTable { clauses, .. } => clauses,
        other => panic!("expected an alter, got {:?}", other),
    }
}

#[test]
fn test_diff_identical_schemas() {
    let a = schema(vec![users(), posts()]);
    let b = schema(vec![users(), posts()]);
    assert!(SchemaDiff::new(&a, &b).is_empty());
    assert!(SchemaDiff::new(&Schema::new("x"), &Schema::new("y")).is_empty());
}

#[test]
fn test_new_table_foreign_keys_come_after_creates() {
    let live = schema(vec![]);
    let desired = schema(vec![posts(), users()]);
    let diff = SchemaDiff::new(&live, &desired);

    let summary: Vec<String> = diff.object_diffs.iter().map(|d| d.to_string()).collect();
    assert_eq!(
        summary,
        vec![
            "+ table \"posts\"",
            "+ table \"users\"",
            "~ table \"posts\"\n    + FOREIGN KEY posts_author_id_fkey (author_id) -> users.id",
        ]
    );
    match &diff.object_diffs[0].kind {
        ObjectDiffKind::CreateTable(table) => assert!(table.foreign_keys.is_empty()),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(diff.keys().len(), 2);
}

#[test]
fn test_dropped_table_loses_foreign_keys_first() {
    let live = schema(vec![users(), posts()]);
    let desired = schema(vec![users()]);
    let diff = SchemaDiff::new(&live, &desired);

    assert_eq!(diff.len(), 2);
    assert_eq!(
        clauses(&diff.object_diffs[0]),
        &[TableClause::DropForeignKey(author_fk("posts_author_id_fkey"))]
    );
    assert!(matches!(
        diff.object_diffs[1].kind,
        ObjectDiffKind::DropTable(_)
    ));
}

#[test]
fn test_column_changes() {
    let live = schema(vec![users()]);
    let mut changed = users();
    changed.columns.retain(|c| c.name != "name");
    changed.columns[1].data_type = "character varying(200)".to_string();
    changed.columns[1].nullable = true;
    changed
        .columns
        .push(Column::new("created_at", "timestamp with time zone").not_null());
    changed.columns[2].default = Some("now()".to_string());
    let desired = schema(vec![changed]);

    let diff = SchemaDiff::new(&live, &desired);
    assert_eq!(diff.len(), 1);
    let clauses = clauses(&diff.object_diffs[0]);
    assert!(matches!(&clauses[0], TableClause::DropColumn(c) if c.name == "name"));
    assert_eq!(
        clauses[1],
        TableClause::AlterColumnType {
            name: "email".to_string(),
            from: "text".to_string(),
            to: "character varying(200)".to_string(),
        }
    );
    assert_eq!(
        clauses[2],
        TableClause::AlterColumnNullable {
            name: "email".to_string(),
            nullable: true,
        }
    );
    assert!(matches!(&clauses[3], TableClause::AddColumn(c) if c.name == "created_at"));
    assert_eq!(clauses.len(), 4);
}

#[test]
fn test_identity_position_alone_is_a_restart() {
    let mut used = users();
    used.columns[0] = identity_column("id", 42);
    let diff = SchemaDiff::new(&schema(vec![used]), &schema(vec![users()]));
    assert_eq!(
        clauses(&diff.object_diffs[0]),
        &[TableClause::RestartIdentity {
            name: "id".to_string(),
            from_next: 42,
            to_next: 1,
        }]
    );
}

#[test]
fn test_serial_to_identity_drops_default_first() {
    let mut serial = users();
    serial.columns[0] = Column {
        default: Some("nextval('users_id_seq'::regclass)".to_string()),
        ..Column::new("id", "bigint").not_null()
    };
    let diff = SchemaDiff::new(&schema(vec![serial]), &schema(vec![users()]));
    let clauses = clauses(&diff.object_diffs[0]);
    assert!(matches!(
        &clauses[0],
        TableClause::AlterColumnDefault { to: None, .. }
    ));
    assert!(matches!(
        &clauses[1],
        TableClause::AlterIdentity {
            from: None,
            to: Some(_),
            ..
        }
    ));
}

#[test]
fn test_renamed_index_is_detected() {
    let mut live = users();
    live.indices.push(plain_index("users_name_idx", "name"));
    let mut desired = users();
    desired.indices.push(plain_index("users_by_name", "name"));

    let diff = SchemaDiff::new(&schema(vec![live]), &schema(vec![desired]));
    assert_eq!(
        clauses(&diff.object_diffs[0]),
        &[TableClause::RenameIndex {
            from: "users_name_idx".to_string(),
            to: "users_by_name".to_string(),
        }]
    );
}

#[test]
fn test_changed_index_is_dropped_and_added() {
    let mut live = users();
    live.indices.push(plain_index("users_name_idx", "name"));
    let mut desired = users();
    let mut idx = plain_index("users_name_idx", "name");
    idx.columns[0] = IndexColumn::desc("name");
    desired.indices.push(idx.clone());

    let diff = SchemaDiff::new(&schema(vec![live]), &schema(vec![desired]));
    let clauses = clauses(&diff.object_diffs[0]);
    assert!(matches!(&clauses[0], TableClause::DropIndex(i) if i.name == "users_name_idx"));
    assert_eq!(clauses[1], TableClause::AddIndex(idx));
}

#[test]
fn test_renamed_foreign_key_is_not_a_drop() {
    let live = schema(vec![users(), posts()]);
    let mut renamed = posts();
    renamed.foreign_keys = vec![author_fk("fk_post_author")];
    let desired = schema(vec![users(), renamed]);

    let diff = SchemaDiff::new(&live, &desired);
    assert_eq!(diff.len(), 1);
    assert_eq!(
        clauses(&diff.object_diffs[0]),
        &[TableClause::RenameForeignKey {
            from: "posts_author_id_fkey".to_string(),
            to: "fk_post_author".to_string(),
        }]
    );
}

#[test]
fn test_changed_foreign_key_splits_around_alters() {
    let live = schema(vec![users(), posts()]);
    let mut changed = posts();
    changed.foreign_keys[0].on_delete = ReferentialAction::Restrict;
    changed.columns.push(Column::new("body", "text"));
    let desired = schema(vec![users(), changed]);

    let diff = SchemaDiff::new(&live, &desired);
    let summary: Vec<&str> = diff
        .object_diffs
        .iter()
        .map(|d| match clauses(d)[0] {
            TableClause::DropForeignKey(_) => "drop fk",
            TableClause::AddColumn(_) => "add column",
            TableClause::AddForeignKey(_) => "add fk",
            _ => "other",
        })
        .collect();
    assert_eq!(summary, vec!["drop fk", "add column", "add fk"]);
}

#[test]
fn test_unsupported_table_is_reported_once() {
    let mut live = posts();
    live.unsupported = Some("partitioned table".to_string());
    let mut desired = live.clone();
    desired.foreign_keys.clear();
    desired.columns.push(Column::new("body", "text"));

    let diff = SchemaDiff::new(&schema(vec![live.clone()]), &schema(vec![desired]));
    assert_eq!(diff.len(), 1);
    assert_eq!(clauses(&diff.object_diffs[0]).len(), 2);

    // differing only in what we cannot see still counts
    let mut other = live.clone();
    other.unsupported = Some("inherits from events".to_string());
    let diff = SchemaDiff::new(&schema(vec![live]), &schema(vec![other]));
    assert_eq!(diff.len(), 1);
    assert!(clauses(&diff.object_diffs[0]).is_empty());
}

fn routine(kind: ObjectType, arguments: &str, body: &str) -> Routine {
    Routine {
        name: "touch".to_string(),
        kind,
        arguments: arguments.to_string(),
        definition: format!(
            "CREATE OR REPLACE FUNCTION public.touch({})\n RETURNS integer\n LANGUAGE sql\nAS $function${}$function$\n",
            arguments, body
        ),
    }
}

#[test]
fn test_routine_changes() {
    let mut live = Schema::new("app");
    live.add_routine(routine(ObjectType::Function, "", "SELECT 1"));

    let mut same = Schema::new("app");
    let mut reformatted = routine(ObjectType::Function, "", "SELECT 1");
    reformatted.definition = reformatted.definition.replace('\n', "\n   ");
    same.add_routine(reformatted);
    assert!(SchemaDiff::new(&live, &same).is_empty());

    let mut changed = Schema::new("app");
    changed.add_routine(routine(ObjectType::Function, "", "SELECT 2"));
    let diff = SchemaDiff::new(&live, &changed);
    assert!(matches!(
        diff.object_diffs[0].kind,
        ObjectDiffKind::ReplaceRoutine { .. }
    ));
    assert!(!diff.has_table_diffs());

    let diff = SchemaDiff::new(&live, &Schema::new("app"));
    assert!(matches!(
        diff.object_diffs[0].kind,
        ObjectDiffKind::DropRoutine(_)
    ));
}

#[test]
fn test_ordering_across_kinds() {
    let mut live = schema(vec![users(), posts()]);
    live.add_routine(routine(ObjectType::Procedure, "", "SELECT 1"));
    let mut desired = schema(vec![users()]);
    let mut comments = Table::new("comments");
    comments.columns = vec![identity_column("id", 1)];
    desired.add_table(comments);
    desired.add_routine(routine(ObjectType::Function, "", "SELECT 1"));

    let diff = SchemaDiff::new(&live, &desired);
    insta::assert_snapshot!(diff.to_string(), @r#"
~ table "posts"
    - FOREIGN KEY posts_author_id_fkey
+ function "touch"
+ table "comments"
- table "posts"
- procedure "touch"
"#);
}
