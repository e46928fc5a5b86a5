use std::sync::Arc;

use skiff_db_schema::{ObjectKey, Schema, SourceLocation, Table};
use tracing::{debug, info};

use super::Target;
use crate::ddl::{NextAutoInc, StatementModifiers, create_index_sql, create_table_sql};
use crate::diff::{ObjectDiff, ObjectDiffKind, SchemaDiff, TableClause};
use crate::fs::{LogicalSchema, Statement};
use crate::workspace::exec_logical_schema;
use crate::{Error, Result};

/// Check that the generated ALTERs really turn each live table into the
/// desired one.
///
/// The live definitions of the altered tables are created in a workspace,
/// the ALTERs run against them, and the result is compared with the desired
/// tables. Foreign keys are left out: the tables they reference are not
/// there.
pub async fn verify_diff(diff: &SchemaDiff, target: &Target) -> Result<()> {
    let mods = StatementModifiers {
        next_auto_inc: NextAutoInc::Ignore,
        allow_unsafe: true,
        strict_index_naming: true,
        strict_foreign_key_naming: true,
        ..Default::default()
    };

    let mut logical = LogicalSchema::new();
    let mut index_statements = Vec::new();
    let mut alter_statements = Vec::new();
    let mut verified = Vec::new();

    for object_diff in diff.table_diffs() {
        let ObjectDiffKind::AlterTable { from, to, clauses } = &object_diff.kind else {
            continue;
        };
        if from.unsupported.is_some() || to.unsupported.is_some() {
            continue;
        }
        let clauses: Vec<TableClause> = clauses
            .iter()
            .filter(|c| {
                !matches!(
                    c,
                    TableClause::AddForeignKey(_)
                        | TableClause::DropForeignKey(_)
                        | TableClause::RenameForeignKey { .. }
                )
            })
            .cloned()
            .collect();
        if clauses.is_empty() {
            continue;
        }

        let key = object_diff.key.clone();
        if !verified.contains(&key.name) {
            let live = without_foreign_keys(from);
            logical.creates.push(statement(&key, create_table_sql(&live)));
            index_statements.extend(
                live.indices
                    .iter()
                    .filter(|idx| !idx.constraint)
                    .map(|idx| statement(&key, create_index_sql(&live, idx, false))),
            );
            verified.push(key.name.clone());
        }

        let stripped = ObjectDiff {
            key: key.clone(),
            kind: ObjectDiffKind::AlterTable {
                from: from.clone(),
                to: to.clone(),
                clauses,
            },
        };
        if let Some(ddl) = stripped.statement(&mods)? {
            alter_statements.extend(ddl.parts.into_iter().map(|part| statement(&key, part)));
        }
    }

    if verified.is_empty() {
        return Ok(());
    }
    logical.alters = index_statements;
    logical.alters.extend(alter_statements);

    info!(
        database = %target.schema_name,
        tables = verified.len(),
        "verifying generated DDL in a workspace"
    );
    let result = exec_logical_schema(Arc::new(logical), target.workspace.clone()).await?;
    if let Some(failure) = result.failures.first() {
        return Err(Error::Verify(format!(
            "{}: generated DDL for {} failed in the workspace: {}",
            target.schema_name,
            failure.key(),
            failure.err
        )));
    }

    for name in &verified {
        let actual = result.schema.get_table(name).map(normalized);
        let expected = target.desired_schema().get_table(name).map(normalized);
        if actual == expected {
            continue;
        }
        let mut explanation = String::new();
        if let (Some(actual), Some(expected)) = (actual, expected) {
            let mut a = Schema::new("actual");
            a.add_table(actual);
            let mut b = Schema::new("expected");
            b.add_table(expected);
            explanation = SchemaDiff::new(&a, &b).to_string();
        }
        debug!("{}", explanation);
        return Err(Error::Verify(format!(
            "{}: table {} does not match its desired definition after running the generated DDL\n{}",
            target.schema_name, name, explanation
        )));
    }
    Ok(())
}

fn statement(key: &ObjectKey, text: String) -> Statement {
    Statement {
        object: key.clone(),
        location: SourceLocation::default(),
        text,
    }
}

fn without_foreign_keys(table: &Table) -> Table {
    let mut table = table.clone();
    table.foreign_keys.clear();
    table
}

/// What verification compares: no foreign keys, no sequence positions and
/// no column order (an added column always lands last).
fn normalized(table: &Table) -> Table {
    let mut table = without_foreign_keys(table);
    for col in &mut table.columns {
        if let Some(identity) = &mut col.identity {
            identity.next = identity.start;
        }
    }
    table.columns.sort_by(|a, b| a.name.cmp(&b.name));
    table.indices.sort_by(|a, b| a.name.cmp(&b.name));
    table
        .check_constraints
        .sort_by(|a, b| a.name.cmp(&b.name));
    table
}
