//! Lint: Redundant indexes.
//!
//! An index is redundant when another index (or the primary key) already
//! covers its columns as a leading prefix, in the same order. A unique index
//! is only redundant to another unique index on exactly the same columns.
//! Partial indexes are never reported.

use skiff_db_schema::{Index, IndexColumn, Table};

use super::{AnnotationBuilder, LintContext};

pub fn lint_dupe_index(ctx: &mut LintContext<'_>) {
    let table = ctx.table;
    let mut candidates: Vec<Index> = table.indices.clone();
    if let Some(pk) = primary_key_index(table) {
        candidates.insert(0, pk);
    }

    for (i, idx) in table.indices.iter().enumerate() {
        let position = i + candidates.len() - table.indices.len();
        let covering = candidates
            .iter()
            .enumerate()
            .find(|(j, other)| *j != position && covers(other, idx, *j < position));
        if let Some((_, other)) = covering {
            AnnotationBuilder::new("dupe-index", ctx.options.dupe_index)
                .msg(format!(
                    "index {} on table {} is redundant to {}",
                    idx.name, table.name, other.name
                ))
                .emit(ctx);
        }
    }
}

fn primary_key_index(table: &Table) -> Option<Index> {
    let pk = table.primary_key.as_ref()?;
    Some(Index {
        name: pk.name.clone(),
        columns: pk.columns.iter().map(IndexColumn::new).collect(),
        unique: true,
        constraint: true,
        where_clause: None,
    })
}

/// Whether `other` makes `idx` redundant. Of two identical indexes only the
/// later one is reported, so `other_first` says which one that is.
fn covers(other: &Index, idx: &Index, other_first: bool) -> bool {
    if idx.where_clause.is_some() || other.where_clause.is_some() {
        return false;
    }
    if !other.columns.starts_with(&idx.columns) {
        return false;
    }
    let same_columns = other.columns.len() == idx.columns.len();
    if idx.unique {
        return other.unique && same_columns && other_first;
    }
    if same_columns {
        // an identical unique index always wins; otherwise the earlier one does
        return other.unique || other_first;
    }
    true
}
