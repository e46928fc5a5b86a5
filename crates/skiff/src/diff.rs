//! Schema diffing: compare a live schema against the desired one.
//!
//! [`SchemaDiff::new`] walks both schemas and produces an ordered list of
//! [`ObjectDiff`]s. Turning those into SQL is the job of [`crate::ddl`]; the
//! diff itself never looks at statement modifiers, so every difference is
//! reported here and filtered (or rejected) when rendering.
//!
//! ## Ordering
//!
//! Foreign keys make the order of statements matter. Diffs come out as:
//!
//! 1. foreign keys being dropped, including those of tables being dropped
//! 2. new and replaced routines
//! 3. new tables, without their foreign keys
//! 4. everything else about altered tables
//! 5. foreign keys being added, including those of new tables
//! 6. dropped tables
//! 7. dropped routines
//!
//! A single table may therefore show up in up to three diffs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use skiff_db_schema::{
    CheckConstraint, Column, ForeignKey, Identity, Index, ObjectKey, PrimaryKey, Routine, Schema,
    Table,
};
use skiff_sql::normalize_whitespace;

/// The differences between two schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    pub object_diffs: Vec<ObjectDiff>,
}

/// The difference for one object.
#[derive(Debug, Clone)]
pub struct ObjectDiff {
    pub key: ObjectKey,
    pub kind: ObjectDiffKind,
}

#[derive(Debug, Clone)]
pub enum ObjectDiffKind {
    CreateTable(Arc<Table>),
    DropTable(Arc<Table>),
    /// Both sides are kept so unsupported tables can be explained.
    AlterTable {
        from: Arc<Table>,
        to: Arc<Table>,
        clauses: Vec<TableClause>,
    },
    CreateRoutine(Arc<Routine>),
    DropRoutine(Arc<Routine>),
    ReplaceRoutine {
        from: Arc<Routine>,
        to: Arc<Routine>,
    },
}

/// A single change inside an ALTER TABLE.
#[derive(Debug, Clone, PartialEq)]
pub enum TableClause {
    AddColumn(Column),
    DropColumn(Column),
    AlterColumnType {
        name: String,
        from: String,
        to: String,
    },
    AlterColumnNullable {
        name: String,
        nullable: bool,
    },
    AlterColumnDefault {
        name: String,
        from: Option<String>,
        to: Option<String>,
    },
    /// Identity added, removed or switched between ALWAYS and BY DEFAULT.
    AlterIdentity {
        name: String,
        from: Option<Identity>,
        to: Option<Identity>,
    },
    /// Only the sequence position of an identity column differs.
    RestartIdentity {
        name: String,
        from_next: i64,
        to_next: i64,
    },
    AddPrimaryKey(PrimaryKey),
    DropPrimaryKey(PrimaryKey),
    AddForeignKey(ForeignKey),
    DropForeignKey(ForeignKey),
    /// Same foreign key under another name.
    RenameForeignKey {
        from: String,
        to: String,
    },
    AddCheck(CheckConstraint),
    DropCheck(CheckConstraint),
    AddIndex(Index),
    DropIndex(Index),
    /// Same index under another name.
    RenameIndex {
        from: String,
        to: String,
    },
}

impl TableClause {
    /// Whether applying this clause can lose data.
    pub fn unsafe_reason(&self) -> Option<String> {
        match self {
            TableClause::DropColumn(col) => Some(format!("drops column {}", col.name)),
            TableClause::AlterColumnType { name, from, to } => Some(format!(
                "changes the type of column {} from {} to {}",
                name, from, to
            )),
            _ => None,
        }
    }

    fn is_foreign_key_drop(&self) -> bool {
        matches!(self, TableClause::DropForeignKey(_))
    }

    fn is_foreign_key_add(&self) -> bool {
        matches!(self, TableClause::AddForeignKey(_))
    }
}

impl SchemaDiff {
    /// Compute the changes that turn `from` (usually a live database) into
    /// `to` (usually a workspace's result).
    pub fn new(from: &Schema, to: &Schema) -> SchemaDiff {
        let mut fk_drops = Vec::new();
        let mut routine_creates = Vec::new();
        let mut table_creates = Vec::new();
        let mut table_alters = Vec::new();
        let mut fk_adds = Vec::new();
        let mut table_drops = Vec::new();
        let mut routine_drops = Vec::new();

        for (name, to_table) in &to.tables {
            let key = to_table.key();
            match from.tables.get(name) {
                None => {
                    let mut bare = Table::clone(to_table);
                    let fks = std::mem::take(&mut bare.foreign_keys);
                    let bare = Arc::new(bare);
                    table_creates.push(ObjectDiff {
                        key: key.clone(),
                        kind: ObjectDiffKind::CreateTable(bare.clone()),
                    });
                    if !fks.is_empty() {
                        fk_adds.push(ObjectDiff {
                            key,
                            kind: ObjectDiffKind::AlterTable {
                                from: bare,
                                to: to_table.clone(),
                                clauses: fks.into_iter().map(TableClause::AddForeignKey).collect(),
                            },
                        });
                    }
                }
                Some(from_table) => {
                    let clauses = diff_table(from_table, to_table);
                    if clauses.is_empty() && !tables_differ_unsupported(from_table, to_table) {
                        continue;
                    }
                    let (drops, rest): (Vec<_>, Vec<_>) =
                        clauses.into_iter().partition(|c| c.is_foreign_key_drop());
                    let (adds, rest): (Vec<_>, Vec<_>) =
                        rest.into_iter().partition(|c| c.is_foreign_key_add());
                    let unsupported =
                        from_table.unsupported.is_some() || to_table.unsupported.is_some();

                    let alter = |clauses: Vec<TableClause>| ObjectDiff {
                        key: key.clone(),
                        kind: ObjectDiffKind::AlterTable {
                            from: from_table.clone(),
                            to: to_table.clone(),
                            clauses,
                        },
                    };
                    // unsupported tables are reported once, as a whole
                    if unsupported {
                        let mut all = drops;
                        all.extend(rest);
                        all.extend(adds);
                        table_alters.push(alter(all));
                        continue;
                    }
                    if !drops.is_empty() {
                        fk_drops.push(alter(drops));
                    }
                    if !rest.is_empty() {
                        table_alters.push(alter(rest));
                    }
                    if !adds.is_empty() {
                        fk_adds.push(alter(adds));
                    }
                }
            }
        }

        for (name, from_table) in &from.tables {
            if to.tables.contains_key(name) {
                continue;
            }
            if !from_table.foreign_keys.is_empty() && from_table.unsupported.is_none() {
                let mut bare = Table::clone(from_table);
                bare.foreign_keys.clear();
                fk_drops.push(ObjectDiff {
                    key: from_table.key(),
                    kind: ObjectDiffKind::AlterTable {
                        from: from_table.clone(),
                        to: Arc::new(bare),
                        clauses: from_table
                            .foreign_keys
                            .iter()
                            .cloned()
                            .map(TableClause::DropForeignKey)
                            .collect(),
                    },
                });
            }
            table_drops.push(ObjectDiff {
                key: from_table.key(),
                kind: ObjectDiffKind::DropTable(from_table.clone()),
            });
        }

        for (name, to_routine) in &to.routines {
            match from.routines.get(name) {
                None => routine_creates.push(ObjectDiff {
                    key: to_routine.key(),
                    kind: ObjectDiffKind::CreateRoutine(to_routine.clone()),
                }),
                Some(from_routine) if from_routine.kind != to_routine.kind => {
                    // a function became a procedure (or the reverse): two objects
                    routine_drops.push(ObjectDiff {
                        key: from_routine.key(),
                        kind: ObjectDiffKind::DropRoutine(from_routine.clone()),
                    });
                    routine_creates.push(ObjectDiff {
                        key: to_routine.key(),
                        kind: ObjectDiffKind::CreateRoutine(to_routine.clone()),
                    });
                }
                Some(from_routine) => {
                    if !routines_match(from_routine, to_routine) {
                        routine_creates.push(ObjectDiff {
                            key: to_routine.key(),
                            kind: ObjectDiffKind::ReplaceRoutine {
                                from: from_routine.clone(),
                                to: to_routine.clone(),
                            },
                        });
                    }
                }
            }
        }
        for (name, from_routine) in &from.routines {
            if !to.routines.contains_key(name) {
                routine_drops.push(ObjectDiff {
                    key: from_routine.key(),
                    kind: ObjectDiffKind::DropRoutine(from_routine.clone()),
                });
            }
        }

        let mut object_diffs = fk_drops;
        object_diffs.extend(routine_creates);
        object_diffs.extend(table_creates);
        object_diffs.extend(table_alters);
        object_diffs.extend(fk_adds);
        object_diffs.extend(table_drops);
        object_diffs.extend(routine_drops);
        SchemaDiff { object_diffs }
    }

    pub fn is_empty(&self) -> bool {
        self.object_diffs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.object_diffs.len()
    }

    /// Diffs that touch tables.
    pub fn table_diffs(&self) -> impl Iterator<Item = &ObjectDiff> {
        self.object_diffs.iter().filter(|d| d.is_table_diff())
    }

    pub fn has_table_diffs(&self) -> bool {
        self.table_diffs().next().is_some()
    }

    /// Keys of every object with a difference, without repeats.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut seen = HashSet::new();
        self.object_diffs
            .iter()
            .filter(|d| seen.insert(d.key.clone()))
            .map(|d| d.key.clone())
            .collect()
    }
}

impl ObjectDiff {
    pub fn is_table_diff(&self) -> bool {
        matches!(
            self.kind,
            ObjectDiffKind::CreateTable(_)
                | ObjectDiffKind::DropTable(_)
                | ObjectDiffKind::AlterTable { .. }
        )
    }
}

fn routines_match(a: &Routine, b: &Routine) -> bool {
    a.arguments == b.arguments
        && normalize_whitespace(&a.definition) == normalize_whitespace(&b.definition)
}

/// Unsupported tables that differ only in ways we cannot see as clauses
/// (a partition bound, an inheritance parent, ...) still count as changed.
fn tables_differ_unsupported(from: &Table, to: &Table) -> bool {
    (from.unsupported.is_some() || to.unsupported.is_some()) && from.unsupported != to.unsupported
}

/// All clauses needed to turn `from` into `to`, in the order they should run.
fn diff_table(from: &Table, to: &Table) -> Vec<TableClause> {
    let mut clauses = Vec::new();

    clauses.extend(diff_foreign_keys(&from.foreign_keys, &to.foreign_keys));

    // drop the old primary key before touching its columns
    let pk_changed = match (&from.primary_key, &to.primary_key) {
        (Some(a), Some(b)) => a.columns != b.columns,
        (None, None) => false,
        _ => true,
    };
    if pk_changed && let Some(pk) = &from.primary_key {
        clauses.push(TableClause::DropPrimaryKey(pk.clone()));
    }

    clauses.extend(diff_checks(&from.check_constraints, &to.check_constraints, true));
    clauses.extend(diff_indices(&from.indices, &to.indices, true));
    clauses.extend(diff_columns(&from.columns, &to.columns));

    if pk_changed && let Some(pk) = &to.primary_key {
        clauses.push(TableClause::AddPrimaryKey(pk.clone()));
    }
    clauses.extend(diff_checks(&from.check_constraints, &to.check_constraints, false));
    clauses.extend(diff_indices(&from.indices, &to.indices, false));

    clauses
}

fn diff_columns(from: &[Column], to: &[Column]) -> Vec<TableClause> {
    let mut clauses = Vec::new();

    for col in from {
        if !to.iter().any(|c| c.name == col.name) {
            clauses.push(TableClause::DropColumn(col.clone()));
        }
    }

    for to_col in to {
        let Some(from_col) = from.iter().find(|c| c.name == to_col.name) else {
            clauses.push(TableClause::AddColumn(to_col.clone()));
            continue;
        };
        let name = to_col.name.clone();

        if from_col.data_type != to_col.data_type {
            clauses.push(TableClause::AlterColumnType {
                name: name.clone(),
                from: from_col.data_type.clone(),
                to: to_col.data_type.clone(),
            });
        }

        // an identity column has no default; drop one before the other appears
        let identity_changed = match (&from_col.identity, &to_col.identity) {
            (Some(a), Some(b)) => !a.same_definition(b),
            (None, None) => false,
            _ => true,
        };
        if from_col.default != to_col.default && from_col.default.is_some() {
            clauses.push(TableClause::AlterColumnDefault {
                name: name.clone(),
                from: from_col.default.clone(),
                to: to_col.default.clone(),
            });
        }
        if identity_changed {
            clauses.push(TableClause::AlterIdentity {
                name: name.clone(),
                from: from_col.identity,
                to: to_col.identity,
            });
        } else if let (Some(a), Some(b)) = (&from_col.identity, &to_col.identity)
            && a.next != b.next
        {
            clauses.push(TableClause::RestartIdentity {
                name: name.clone(),
                from_next: a.next,
                to_next: b.next,
            });
        }
        if from_col.default != to_col.default && from_col.default.is_none() {
            clauses.push(TableClause::AlterColumnDefault {
                name: name.clone(),
                from: None,
                to: to_col.default.clone(),
            });
        }

        if from_col.nullable != to_col.nullable {
            clauses.push(TableClause::AlterColumnNullable {
                name,
                nullable: to_col.nullable,
            });
        }
    }

    clauses
}

/// Foreign keys are matched by definition first and by name second, so a
/// foreign key that was only renamed becomes a rename.
fn diff_foreign_keys(from: &[ForeignKey], to: &[ForeignKey]) -> Vec<TableClause> {
    let mut clauses = Vec::new();
    let mut matched_from = HashSet::new();
    let mut adds = Vec::new();

    for to_fk in to {
        if let Some(same) = from.iter().find(|fk| fk.name == to_fk.name)
            && same.equivalent(to_fk)
        {
            matched_from.insert(same.name.as_str());
            continue;
        }
        let renamed = from.iter().find(|fk| {
            !matched_from.contains(fk.name.as_str())
                && fk.equivalent(to_fk)
                && !to.iter().any(|other| other.name == fk.name)
        });
        match renamed {
            Some(fk) => {
                matched_from.insert(fk.name.as_str());
                adds.push(TableClause::RenameForeignKey {
                    from: fk.name.clone(),
                    to: to_fk.name.clone(),
                });
            }
            None => adds.push(TableClause::AddForeignKey(to_fk.clone())),
        }
    }

    for fk in from {
        if !matched_from.contains(fk.name.as_str()) {
            clauses.push(TableClause::DropForeignKey(fk.clone()));
        }
    }
    clauses.extend(adds);
    clauses
}

/// With `drops` set, the checks to drop; otherwise the checks to add.
fn diff_checks(from: &[CheckConstraint], to: &[CheckConstraint], drops: bool) -> Vec<TableClause> {
    if drops {
        from.iter()
            .filter(|c| !to.contains(c))
            .cloned()
            .map(TableClause::DropCheck)
            .collect()
    } else {
        to.iter()
            .filter(|c| !from.contains(c))
            .cloned()
            .map(TableClause::AddCheck)
            .collect()
    }
}

/// Like [`diff_checks`], but an index that only changed its name is a rename
/// (reported with the adds).
fn diff_indices(from: &[Index], to: &[Index], drops: bool) -> Vec<TableClause> {
    let mut matched_from: HashSet<&str> = HashSet::new();
    let mut adds = Vec::new();

    for to_idx in to {
        if let Some(same) = from.iter().find(|i| i.name == to_idx.name)
            && same.equivalent(to_idx)
        {
            matched_from.insert(same.name.as_str());
            continue;
        }
        let renamed = from.iter().find(|i| {
            !matched_from.contains(i.name.as_str())
                && i.equivalent(to_idx)
                && !to.iter().any(|other| other.name == i.name)
        });
        match renamed {
            Some(idx) => {
                matched_from.insert(idx.name.as_str());
                adds.push(TableClause::RenameIndex {
                    from: idx.name.clone(),
                    to: to_idx.name.clone(),
                });
            }
            None => adds.push(TableClause::AddIndex(to_idx.clone())),
        }
    }

    if drops {
        from.iter()
            .filter(|i| !matched_from.contains(i.name.as_str()))
            .cloned()
            .map(TableClause::DropIndex)
            .collect()
    } else {
        adds
    }
}

impl fmt::Display for TableClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableClause::AddColumn(col) => {
                let nullable = if col.nullable { " (nullable)" } else { "" };
                write!(f, "+ {}: {}{}", col.name, col.data_type, nullable)
            }
            TableClause::DropColumn(col) => write!(f, "- {}", col.name),
            TableClause::AlterColumnType { name, from, to } => {
                write!(f, "~ {}: {} -> {}", name, from, to)
            }
            TableClause::AlterColumnNullable { name, nullable } => {
                let to = if *nullable { "nullable" } else { "not null" };
                write!(f, "~ {}: {}", name, to)
            }
            TableClause::AlterColumnDefault { name, from, to } => {
                let from = from.as_deref().unwrap_or("(none)");
                let to = to.as_deref().unwrap_or("(none)");
                write!(f, "~ {} default: {} -> {}", name, from, to)
            }
            TableClause::AlterIdentity { name, to, .. } => match to {
                Some(id) if id.always => write!(f, "~ {}: generated always as identity", name),
                Some(_) => write!(f, "~ {}: generated by default as identity", name),
                None => write!(f, "~ {}: no identity", name),
            },
            TableClause::RestartIdentity {
                name,
                from_next,
                to_next,
            } => write!(f, "~ {} next value: {} -> {}", name, from_next, to_next),
            TableClause::AddPrimaryKey(pk) => {
                write!(f, "+ PRIMARY KEY ({})", pk.columns.join(", "))
            }
            TableClause::DropPrimaryKey(pk) => {
                write!(f, "- PRIMARY KEY ({})", pk.columns.join(", "))
            }
            TableClause::AddForeignKey(fk) => write!(
                f,
                "+ FOREIGN KEY {} ({}) -> {}.{}",
                fk.name,
                fk.columns.join(", "),
                fk.references_table,
                fk.references_columns.join(", ")
            ),
            TableClause::DropForeignKey(fk) => write!(f, "- FOREIGN KEY {}", fk.name),
            TableClause::RenameForeignKey { from, to } => {
                write!(f, "~ FOREIGN KEY {} -> {}", from, to)
            }
            TableClause::AddCheck(check) => write!(f, "+ {} {}", check.name, check.expr),
            TableClause::DropCheck(check) => write!(f, "- CHECK {}", check.name),
            TableClause::AddIndex(idx) => {
                let unique = if idx.unique { "UNIQUE " } else { "" };
                write!(
                    f,
                    "+ {}INDEX {} ({})",
                    unique,
                    idx.name,
                    idx.column_names().join(", ")
                )
            }
            TableClause::DropIndex(idx) => write!(f, "- INDEX {}", idx.name),
            TableClause::RenameIndex { from, to } => write!(f, "~ INDEX {} -> {}", from, to),
        }
    }
}

impl fmt::Display for ObjectDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjectDiffKind::CreateTable(_) | ObjectDiffKind::CreateRoutine(_) => {
                write!(f, "+ {}", self.key)
            }
            ObjectDiffKind::DropTable(_) | ObjectDiffKind::DropRoutine(_) => {
                write!(f, "- {}", self.key)
            }
            ObjectDiffKind::ReplaceRoutine { .. } => write!(f, "~ {}", self.key),
            ObjectDiffKind::AlterTable { clauses, .. } => {
                write!(f, "~ {}", self.key)?;
                for clause in clauses {
                    write!(f, "\n    {}", clause)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes detected.");
        }
        for diff in &self.object_diffs {
            writeln!(f, "{}", diff)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
