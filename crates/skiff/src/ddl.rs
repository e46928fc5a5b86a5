//! Rendering diffs as DDL.
//!
//! [`ObjectDiff::statement`] turns one diff into a [`DdlStatement`], applying
//! the [`StatementModifiers`] configured for the directory. A statement is
//! made of parts; each part is sent to the server on its own (statements such
//! as `CREATE INDEX CONCURRENTLY` cannot share a query string with others).

use std::fmt;

use regex::Regex;
use skiff_db_schema::{Column, ForeignKey, Index, ObjectKey, ReferentialAction, Routine, Table};
use skiff_sql::{quote_ident, quote_idents};
use thiserror::Error;

use crate::diff::{ObjectDiff, ObjectDiffKind, TableClause};
use crate::fs::{ConfigError, Dir};

/// `lock_timeout` used for `alter_lock = nowait`.
pub const NOWAIT_LOCK_TIMEOUT: &str = "10ms";

/// When to carry an identity column's sequence position over to a live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextAutoInc {
    /// Never.
    Ignore,
    /// When the desired position is ahead of the live one.
    #[default]
    IfIncreased,
    /// When the live sequence has already been used.
    IfAlready,
    /// Whenever the positions differ.
    Always,
}

impl NextAutoInc {
    const NAMES: [&'static str; 4] = ["if-increased", "ignore", "if-already", "always"];

    fn from_name(name: &str) -> Self {
        match name {
            "ignore" => NextAutoInc::Ignore,
            "if-already" => NextAutoInc::IfAlready,
            "always" => NextAutoInc::Always,
            _ => NextAutoInc::IfIncreased,
        }
    }
}

/// Knobs that change how diffs are rendered.
#[derive(Debug, Clone, Default)]
pub struct StatementModifiers {
    pub next_auto_inc: NextAutoInc,
    /// Permit statements that can lose data.
    pub allow_unsafe: bool,
    /// Rename indexes whose definition matches but whose name does not.
    pub strict_index_naming: bool,
    /// Rename foreign keys whose definition matches but whose name does not.
    pub strict_foreign_key_naming: bool,
    /// Build and drop plain indexes `CONCURRENTLY`.
    pub concurrently: bool,
    /// Fail fast instead of queueing behind other sessions' locks.
    pub lock_nowait: bool,
    /// Tables whose name matches are left alone.
    pub ignore_table: Option<Regex>,
}

impl StatementModifiers {
    pub fn for_dir(dir: &Dir) -> Result<Self, ConfigError> {
        let config = &dir.config;
        // brief mode only lists what differs; nothing runs
        let brief = config.get_bool("brief")? && config.get_bool("dry_run")?;
        let exact_match = config.get_bool("exact_match")?;
        Ok(Self {
            next_auto_inc: NextAutoInc::from_name(
                &config.get_enum("next_auto_inc", &NextAutoInc::NAMES)?,
            ),
            allow_unsafe: config.get_bool("allow_unsafe")? || brief,
            strict_index_naming: exact_match,
            strict_foreign_key_naming: exact_match,
            concurrently: config.get_enum("alter_algorithm", &["default", "concurrently"])?
                == "concurrently",
            lock_nowait: config.get_enum("alter_lock", &["default", "nowait"])? == "nowait",
            ignore_table: config.get_regex("ignore_table")?,
        })
    }

    fn ignores(&self, key: &ObjectKey) -> bool {
        key.kind == skiff_db_schema::ObjectType::Table
            && self
                .ignore_table
                .as_ref()
                .is_some_and(|re| re.is_match(&key.name))
    }
}

/// Why a diff could not be turned into DDL.
#[derive(Debug, Clone, Error)]
pub enum DdlError {
    /// The object uses features we cannot diff. `extended` shows both sides.
    #[error("{key} uses features skiff cannot diff ({reason})")]
    Unsupported {
        key: ObjectKey,
        reason: String,
        extended: String,
    },

    #[error("{key}: refusing to run unsafe statement that {reason}; set allow_unsafe to permit it")]
    Unsafe { key: ObjectKey, reason: String },
}

/// Rendered DDL for one object diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlStatement {
    pub key: ObjectKey,
    /// Each part is executed as its own query string, in order.
    pub parts: Vec<String>,
}

impl fmt::Display for DdlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{};", part)?;
        }
        Ok(())
    }
}

impl ObjectDiff {
    /// Render this diff. `Ok(None)` means there is nothing to run under
    /// `mods` (an ignored table, or only differences the modifiers suppress).
    pub fn statement(&self, mods: &StatementModifiers) -> Result<Option<DdlStatement>, DdlError> {
        if mods.ignores(&self.key) {
            return Ok(None);
        }
        let parts = match &self.kind {
            ObjectDiffKind::CreateTable(table) => {
                self.check_supported(None, Some(table.as_ref()))?;
                let mut parts = vec![create_table_sql(table)];
                parts.extend(
                    table
                        .indices
                        .iter()
                        .filter(|idx| !idx.constraint)
                        .map(|idx| create_index_sql(table, idx, false)),
                );
                parts
            }
            ObjectDiffKind::DropTable(table) => {
                self.require_safe(mods, "drops the table")?;
                vec![format!("DROP TABLE {}", quote_ident(&table.name))]
            }
            ObjectDiffKind::AlterTable { from, to, clauses } => {
                self.check_supported(Some(from.as_ref()), Some(to.as_ref()))?;
                alter_table_parts(self, from, clauses, mods)?
            }
            ObjectDiffKind::CreateRoutine(routine) => vec![create_routine_sql(routine)],
            ObjectDiffKind::ReplaceRoutine { from, to } => {
                if from.arguments == to.arguments {
                    vec![create_routine_sql(to)]
                } else {
                    vec![drop_routine_sql(from), create_routine_sql(to)]
                }
            }
            ObjectDiffKind::DropRoutine(routine) => {
                self.require_safe(mods, &format!("drops the {}", routine.kind))?;
                vec![drop_routine_sql(routine)]
            }
        };
        if parts.is_empty() {
            return Ok(None);
        }

        let parts = if mods.lock_nowait && self.is_table_diff() {
            parts.into_iter().map(with_lock_timeout).collect()
        } else {
            parts
        };
        Ok(Some(DdlStatement {
            key: self.key.clone(),
            parts,
        }))
    }

    fn require_safe(&self, mods: &StatementModifiers, reason: &str) -> Result<(), DdlError> {
        if mods.allow_unsafe {
            return Ok(());
        }
        Err(DdlError::Unsafe {
            key: self.key.clone(),
            reason: reason.to_string(),
        })
    }

    fn check_supported(&self, from: Option<&Table>, to: Option<&Table>) -> Result<(), DdlError> {
        let reason = [from, to]
            .into_iter()
            .flatten()
            .find_map(|t| t.unsupported.clone());
        let Some(reason) = reason else {
            return Ok(());
        };
        let mut extended = String::new();
        if let Some(from) = from {
            extended.push_str("-- live\n");
            extended.push_str(&create_table_sql(from));
            extended.push_str(";\n");
        }
        if let Some(to) = to {
            extended.push_str("-- desired\n");
            extended.push_str(&create_table_sql(to));
            extended.push_str(";\n");
        }
        Err(DdlError::Unsupported {
            key: self.key.clone(),
            reason,
            extended,
        })
    }
}

/// Statements with `CONCURRENTLY` must run outside a transaction block, so
/// they cannot share a query string with the `SET`.
fn with_lock_timeout(part: String) -> String {
    if part.contains(" CONCURRENTLY ") {
        return part;
    }
    format!(
        "SET lock_timeout = '{}';\n{};\nRESET lock_timeout",
        NOWAIT_LOCK_TIMEOUT, part
    )
}

fn alter_table_parts(
    diff: &ObjectDiff,
    from: &Table,
    clauses: &[TableClause],
    mods: &StatementModifiers,
) -> Result<Vec<String>, DdlError> {
    let table = quote_ident(&diff.key.name);
    let mut parts = Vec::new();
    let mut actions: Vec<String> = Vec::new();

    let flush = |actions: &mut Vec<String>, parts: &mut Vec<String>| {
        if !actions.is_empty() {
            parts.push(format!("ALTER TABLE {}\n    {}", table, actions.join(",\n    ")));
            actions.clear();
        }
    };

    for clause in clauses {
        if let Some(reason) = clause.unsafe_reason() {
            diff.require_safe(mods, &reason)?;
        }
        match clause {
            TableClause::AddColumn(col) => {
                actions.push(format!("ADD COLUMN {}", column_sql(col)));
            }
            TableClause::DropColumn(col) => {
                actions.push(format!("DROP COLUMN {}", quote_ident(&col.name)));
            }
            TableClause::AlterColumnType { name, to, .. } => {
                let col = quote_ident(name);
                actions.push(format!(
                    "ALTER COLUMN {} TYPE {} USING {}::{}",
                    col, to, col, to
                ));
            }
            TableClause::AlterColumnNullable { name, nullable } => {
                let change = if *nullable { "DROP" } else { "SET" };
                actions.push(format!(
                    "ALTER COLUMN {} {} NOT NULL",
                    quote_ident(name),
                    change
                ));
            }
            TableClause::AlterColumnDefault { name, to, .. } => {
                let change = match to {
                    Some(default) => format!("SET DEFAULT {}", default),
                    None => "DROP DEFAULT".to_string(),
                };
                actions.push(format!("ALTER COLUMN {} {}", quote_ident(name), change));
            }
            TableClause::AlterIdentity { name, from, to } => {
                let col = quote_ident(name);
                match (from, to) {
                    (_, None) => actions.push(format!("ALTER COLUMN {} DROP IDENTITY", col)),
                    (None, Some(id)) => actions.push(format!(
                        "ALTER COLUMN {} ADD {}",
                        col,
                        identity_sql(id.always, id.start)
                    )),
                    (Some(old), Some(new)) => {
                        if old.always != new.always {
                            let mode = if new.always { "ALWAYS" } else { "BY DEFAULT" };
                            actions.push(format!("ALTER COLUMN {} SET GENERATED {}", col, mode));
                        }
                        if old.start != new.start {
                            actions.push(format!(
                                "ALTER COLUMN {} SET START WITH {}",
                                col, new.start
                            ));
                        }
                    }
                }
            }
            TableClause::RestartIdentity {
                name,
                from_next,
                to_next,
            } => {
                let live_start = from
                    .column(name)
                    .and_then(|c| c.identity)
                    .map(|id| id.start)
                    .unwrap_or(1);
                let restart = match mods.next_auto_inc {
                    NextAutoInc::Ignore => false,
                    NextAutoInc::IfIncreased => to_next > from_next,
                    NextAutoInc::IfAlready => *from_next > live_start,
                    NextAutoInc::Always => true,
                };
                if restart {
                    actions.push(format!(
                        "ALTER COLUMN {} RESTART WITH {}",
                        quote_ident(name),
                        to_next
                    ));
                }
            }
            TableClause::AddPrimaryKey(pk) => actions.push(format!(
                "ADD CONSTRAINT {} PRIMARY KEY ({})",
                quote_ident(&pk.name),
                quote_idents(&pk.columns)
            )),
            TableClause::DropPrimaryKey(pk) => {
                actions.push(format!("DROP CONSTRAINT {}", quote_ident(&pk.name)));
            }
            TableClause::AddForeignKey(fk) => actions.push(format!("ADD {}", foreign_key_sql(fk))),
            TableClause::DropForeignKey(fk) => {
                actions.push(format!("DROP CONSTRAINT {}", quote_ident(&fk.name)));
            }
            TableClause::RenameForeignKey { from, to } => {
                if mods.strict_foreign_key_naming {
                    flush(&mut actions, &mut parts);
                    parts.push(format!(
                        "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                        table,
                        quote_ident(from),
                        quote_ident(to)
                    ));
                }
            }
            TableClause::AddCheck(check) => actions.push(format!(
                "ADD CONSTRAINT {} {}",
                quote_ident(&check.name),
                check.expr
            )),
            TableClause::DropCheck(check) => {
                actions.push(format!("DROP CONSTRAINT {}", quote_ident(&check.name)));
            }
            TableClause::AddIndex(idx) if idx.constraint => actions.push(format!(
                "ADD CONSTRAINT {} UNIQUE ({})",
                quote_ident(&idx.name),
                quote_idents(&idx.column_names())
            )),
            TableClause::AddIndex(idx) => {
                flush(&mut actions, &mut parts);
                parts.push(create_index_sql(from, idx, mods.concurrently));
            }
            TableClause::DropIndex(idx) if idx.constraint => {
                actions.push(format!("DROP CONSTRAINT {}", quote_ident(&idx.name)));
            }
            TableClause::DropIndex(idx) => {
                flush(&mut actions, &mut parts);
                let concurrently = if mods.concurrently { "CONCURRENTLY " } else { "" };
                parts.push(format!("DROP INDEX {}{}", concurrently, quote_ident(&idx.name)));
            }
            TableClause::RenameIndex { from: old, to: new } => {
                if mods.strict_index_naming {
                    flush(&mut actions, &mut parts);
                    let is_constraint = from.index(old).is_some_and(|i| i.constraint);
                    parts.push(if is_constraint {
                        format!(
                            "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
                            table,
                            quote_ident(old),
                            quote_ident(new)
                        )
                    } else {
                        format!(
                            "ALTER INDEX {} RENAME TO {}",
                            quote_ident(old),
                            quote_ident(new)
                        )
                    });
                }
            }
        }
    }
    flush(&mut actions, &mut parts);
    Ok(parts)
}

fn identity_sql(always: bool, start: i64) -> String {
    let mode = if always { "ALWAYS" } else { "BY DEFAULT" };
    if start == 1 {
        format!("GENERATED {} AS IDENTITY", mode)
    } else {
        format!("GENERATED {} AS IDENTITY (START WITH {})", mode, start)
    }
}

/// Column definition as used in CREATE TABLE and ADD COLUMN.
fn column_sql(col: &Column) -> String {
    if let Some(serial) = col.serial_type() {
        let not_null = if col.nullable { "" } else { " NOT NULL" };
        return format!("{} {}{}", quote_ident(&col.name), serial, not_null);
    }

    let mut def = format!("{} {}", quote_ident(&col.name), col.data_type);
    if let Some(identity) = &col.identity {
        def.push(' ');
        def.push_str(&identity_sql(identity.always, identity.start));
    }
    if !col.nullable && col.identity.is_none() {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        def.push_str(&format!(" DEFAULT {}", default));
    }
    def
}

fn foreign_key_sql(fk: &ForeignKey) -> String {
    let mut sql = format!(
        "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        quote_ident(&fk.name),
        quote_idents(&fk.columns),
        quote_ident(&fk.references_table),
        quote_idents(&fk.references_columns)
    );
    if fk.on_update != ReferentialAction::NoAction {
        sql.push_str(&format!(" ON UPDATE {}", fk.on_update.to_sql()));
    }
    if fk.on_delete != ReferentialAction::NoAction {
        sql.push_str(&format!(" ON DELETE {}", fk.on_delete.to_sql()));
    }
    sql
}

/// CREATE TABLE for `table`, including its primary key, unique constraints
/// and checks.
///
/// Foreign keys are left out: they are added by a later ALTER once every
/// table they reference exists. So are plain indexes; see
/// [`create_index_sql`].
pub fn create_table_sql(table: &Table) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|col| format!("    {}", column_sql(col)))
        .collect();

    if let Some(pk) = &table.primary_key {
        parts.push(format!(
            "    CONSTRAINT {} PRIMARY KEY ({})",
            quote_ident(&pk.name),
            quote_idents(&pk.columns)
        ));
    }
    for idx in table.indices.iter().filter(|i| i.constraint) {
        parts.push(format!(
            "    CONSTRAINT {} UNIQUE ({})",
            quote_ident(&idx.name),
            quote_idents(&idx.column_names())
        ));
    }
    for check in &table.check_constraints {
        parts.push(format!("    CONSTRAINT {} {}", quote_ident(&check.name), check.expr));
    }

    format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(&table.name),
        parts.join(",\n")
    )
}

/// CREATE INDEX for an index that does not back a constraint.
pub fn create_index_sql(table: &Table, idx: &Index, concurrently: bool) -> String {
    let unique = if idx.unique { "UNIQUE " } else { "" };
    let concurrently = if concurrently { "CONCURRENTLY " } else { "" };
    let columns: Vec<_> = idx.columns.iter().map(|c| c.to_sql()).collect();
    let where_clause = idx
        .where_clause
        .as_ref()
        .map(|w| format!(" WHERE {}", w))
        .unwrap_or_default();
    format!(
        "CREATE {}INDEX {}{} ON {} ({}){}",
        unique,
        concurrently,
        quote_ident(&idx.name),
        quote_ident(&table.name),
        columns.join(", "),
        where_clause
    )
}

/// Routine bodies may refer to tables created later in the same run.
fn create_routine_sql(routine: &Routine) -> String {
    format!(
        "SET check_function_bodies = off;\n{};\nRESET check_function_bodies",
        routine.definition.trim().trim_end_matches(';')
    )
}

fn drop_routine_sql(routine: &Routine) -> String {
    format!(
        "DROP {} {}({})",
        routine.kind.keyword(),
        quote_ident(&routine.name),
        routine.arguments
    )
}
