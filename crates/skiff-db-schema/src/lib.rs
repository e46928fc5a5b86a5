//! Database schema types for skiff.
//!
//! This crate contains the schema model shared by introspection, the diff
//! engine, the DDL renderer and the linter. Objects are held behind `Arc` so
//! that a [`Schema`] can be cloned (or renamed) without copying every table.

use indexmap::IndexMap;
use skiff_sql::quote_ident;
use std::fmt;
use std::sync::Arc;

/// Kinds of schema objects skiff manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectType {
    Table,
    Function,
    Procedure,
}

impl ObjectType {
    /// Whether objects of this kind must be created with the routine session
    /// settings instead of the workspace's normal ones.
    ///
    /// Routine bodies are validated at creation time, and during a parallel
    /// CREATE phase the tables they reference may not exist yet.
    pub fn is_session_sensitive(self) -> bool {
        matches!(self, ObjectType::Function | ObjectType::Procedure)
    }

    /// SQL keyword for this object type.
    pub fn keyword(self) -> &'static str {
        match self {
            ObjectType::Table => "TABLE",
            ObjectType::Function => "FUNCTION",
            ObjectType::Procedure => "PROCEDURE",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Table => write!(f, "table"),
            ObjectType::Function => write!(f, "function"),
            ObjectType::Procedure => write!(f, "procedure"),
        }
    }
}

/// Identifies one object in a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectType,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn table(name: impl Into<String>) -> Self {
        Self::new(ObjectType::Table, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, quote_ident(&self.name))
    }
}

/// Identity column settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// `GENERATED ALWAYS` rather than `GENERATED BY DEFAULT`
    pub always: bool,
    /// The sequence's `START WITH` value
    pub start: i64,
    /// The value the sequence hands out next. Equal to `start` for a
    /// sequence that was never used.
    pub next: i64,
}

impl Identity {
    /// Same generation mode and start value; where the sequence currently
    /// is does not count.
    pub fn same_definition(&self, other: &Identity) -> bool {
        self.always == other.always && self.start == other.start
    }
}

/// A database column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Type as rendered by `format_type`, e.g. `character varying(20)`
    pub data_type: String,
    /// Whether the column allows NULL
    pub nullable: bool,
    /// Default value expression (if any)
    pub default: Option<String>,
    /// Identity settings, for `GENERATED ... AS IDENTITY` columns
    pub identity: Option<Identity>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            identity: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Compare two columns, ignoring identity sequence positions.
    pub fn same_definition(&self, other: &Column) -> bool {
        let identity_matches = match (&self.identity, &other.identity) {
            (Some(a), Some(b)) => a.same_definition(b),
            (None, None) => true,
            _ => false,
        };
        self.name == other.name
            && self.data_type == other.data_type
            && self.nullable == other.nullable
            && self.default == other.default
            && identity_matches
    }

    /// For `serial`-style columns (an integer with a `nextval` default on
    /// its own sequence), the matching pseudo-type.
    pub fn serial_type(&self) -> Option<&'static str> {
        let default = self.default.as_deref()?;
        if !(default.starts_with("nextval('") && default.ends_with("_seq'::regclass)")) {
            return None;
        }
        match self.data_type.as_str() {
            "smallint" => Some("smallserial"),
            "integer" => Some("serial"),
            "bigint" => Some("bigserial"),
            _ => None,
        }
    }

    /// Whether the type is a floating point type.
    pub fn is_float(&self) -> bool {
        matches!(self.data_type.as_str(), "real" | "double precision")
    }
}

/// What a foreign key does when the referenced row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Decode the single-letter code stored in `pg_constraint`.
    pub fn from_pg_code(code: &str) -> Self {
        match code {
            "r" => ReferentialAction::Restrict,
            "c" => ReferentialAction::Cascade,
            "n" => ReferentialAction::SetNull,
            "d" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }

    pub fn to_sql(self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForeignKey {
    /// Constraint name
    pub name: String,
    /// Column(s) in this table
    pub columns: Vec<String>,
    /// Referenced table
    pub references_table: String,
    /// Referenced column(s)
    pub references_columns: Vec<String>,
    pub on_update: ReferentialAction,
    pub on_delete: ReferentialAction,
}

impl ForeignKey {
    /// Compare everything except the constraint name.
    pub fn equivalent(&self, other: &ForeignKey) -> bool {
        self.columns == other.columns
            && self.references_table == other.references_table
            && self.references_columns == other.references_columns
            && self.on_update == other.on_update
            && self.on_delete == other.on_delete
    }
}

/// Sort order for index columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ascending order (default)
    #[default]
    Asc,
    /// Descending order
    Desc,
}

impl SortOrder {
    /// Returns the SQL keyword for this sort order, or empty string for ASC (default).
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "",
            SortOrder::Desc => " DESC",
        }
    }
}

/// Nulls ordering for index columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullsOrder {
    /// Use database default (NULLS LAST for ASC, NULLS FIRST for DESC)
    #[default]
    Default,
    /// Sort nulls before non-null values
    First,
    /// Sort nulls after non-null values
    Last,
}

impl NullsOrder {
    /// Returns the SQL clause for this nulls ordering, or empty string for default.
    pub fn to_sql(&self) -> &'static str {
        match self {
            NullsOrder::Default => "",
            NullsOrder::First => " NULLS FIRST",
            NullsOrder::Last => " NULLS LAST",
        }
    }
}

/// A column in an index with optional sort order and nulls ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    /// Column name, or an expression such as `lower(email)`
    pub name: String,
    /// Sort order (ASC or DESC)
    pub order: SortOrder,
    /// Nulls ordering (NULLS FIRST, NULLS LAST, or default)
    pub nulls: NullsOrder,
}

impl IndexColumn {
    /// Create a new index column with default (ASC) ordering and default nulls.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: SortOrder::Asc,
            nulls: NullsOrder::Default,
        }
    }

    /// Create a new index column with DESC ordering and default nulls.
    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: SortOrder::Desc,
            nulls: NullsOrder::Default,
        }
    }

    /// Create a new index column with NULLS FIRST ordering.
    pub fn nulls_first(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: SortOrder::Asc,
            nulls: NullsOrder::First,
        }
    }

    /// Build from a key expression and the `indoption` bits of `pg_index`.
    ///
    /// Nulls ordering that matches the default for the sort direction is
    /// reported as [`NullsOrder::Default`].
    pub fn from_pg(expr: &str, option: i16) -> Self {
        let desc = option & 1 != 0;
        let nulls_first = option & 2 != 0;
        let nulls = match (desc, nulls_first) {
            (false, false) | (true, true) => NullsOrder::Default,
            (false, true) => NullsOrder::First,
            (true, false) => NullsOrder::Last,
        };
        let parsed = Self::parse(expr);
        Self {
            name: parsed.name,
            order: if desc { SortOrder::Desc } else { SortOrder::Asc },
            nulls,
        }
    }

    /// Whether this is an expression rather than a plain column name.
    pub fn is_expression(&self) -> bool {
        self.name.contains('(') || self.name.contains(' ') || self.name.contains("::")
    }

    /// Returns the SQL fragment for this column (name + order + nulls).
    pub fn to_sql(&self) -> String {
        let target = if self.is_expression() {
            format!("({})", self.name)
        } else {
            quote_ident(&self.name)
        };
        format!("{}{}{}", target, self.order.to_sql(), self.nulls.to_sql())
    }

    /// Parse a column specification like "col_name", "col_name DESC", or "col_name DESC NULLS FIRST".
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let upper = spec.to_uppercase();

        // Parse nulls ordering first (it comes at the end)
        let (spec_without_nulls, nulls) = if upper.ends_with(" NULLS FIRST") {
            (&spec[..spec.len() - 12], NullsOrder::First)
        } else if upper.ends_with(" NULLS LAST") {
            (&spec[..spec.len() - 11], NullsOrder::Last)
        } else {
            (spec, NullsOrder::Default)
        };

        let trimmed = spec_without_nulls.trim();
        let upper_trimmed = trimmed.to_uppercase();

        // Parse sort order
        let (name, order) = if upper_trimmed.ends_with(" DESC") {
            (
                trimmed[..trimmed.len() - 5].trim().to_string(),
                SortOrder::Desc,
            )
        } else if upper_trimmed.ends_with(" ASC") {
            (
                trimmed[..trimmed.len() - 4].trim().to_string(),
                SortOrder::Asc,
            )
        } else {
            (trimmed.to_string(), SortOrder::Asc)
        };

        fn unquote_pg_ident_if_quoted(s: &str) -> String {
            let s = s.trim();
            if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
                let inner = &s[1..s.len() - 1];
                return inner.replace("\"\"", "\"");
            }
            s.to_string()
        }

        Self {
            name: unquote_pg_ident_if_quoted(&name),
            order,
            nulls,
        }
    }
}

/// A database index.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    /// Index name
    pub name: String,
    /// Column(s) in the index with sort order
    pub columns: Vec<IndexColumn>,
    /// Whether this is a unique index
    pub unique: bool,
    /// Whether the index backs a `UNIQUE` table constraint
    pub constraint: bool,
    /// Optional WHERE clause for partial indexes
    pub where_clause: Option<String>,
}

impl Index {
    /// Compare everything except the index name.
    pub fn equivalent(&self, other: &Index) -> bool {
        self.columns == other.columns
            && self.unique == other.unique
            && self.constraint == other.constraint
            && self.where_clause == other.where_clause
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Primary key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub name: String,
    pub columns: Vec<String>,
}

/// A table CHECK constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConstraint {
    pub name: String,
    /// Definition as rendered by `pg_get_constraintdef`, e.g. `CHECK (price > 0)`
    pub expr: String,
}

/// Source location of a schema element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    /// Source file path
    pub file: Option<String>,
    /// Line number (1-indexed)
    pub line: Option<u32>,
    /// Column number (1-indexed)
    pub column: Option<u32>,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: Some(file.into()),
            line: Some(line),
            column: Some(column),
        }
    }

    /// Check if we have any source location info.
    pub fn is_known(&self) -> bool {
        self.file.is_some()
    }

    /// Format as "file:line" or "file:line:column"
    pub fn to_string_short(&self) -> Option<String> {
        let file = self.file.as_ref()?;
        match (self.line, self.column) {
            (Some(line), Some(col)) => Some(format!("{}:{}:{}", file, line, col)),
            (Some(line), None) => Some(format!("{}:{}", file, line)),
            _ => Some(file.clone()),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_string_short() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "<unknown>"),
        }
    }
}

/// A database table definition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns, in ordinal order
    pub columns: Vec<Column>,
    pub primary_key: Option<PrimaryKey>,
    /// CHECK constraints
    pub check_constraints: Vec<CheckConstraint>,
    /// Foreign keys
    pub foreign_keys: Vec<ForeignKey>,
    /// Indices, including those backing UNIQUE constraints
    pub indices: Vec<Index>,
    /// Set when the table uses features skiff cannot diff (partitioning,
    /// inheritance, ...); the text explains which.
    pub unsupported: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indices.iter().find(|i| i.name == name)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::table(self.name.clone())
    }
}

/// A stored function or procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub name: String,
    /// [`ObjectType::Function`] or [`ObjectType::Procedure`]
    pub kind: ObjectType,
    /// Identity arguments, e.g. `a integer, b text`
    pub arguments: String,
    /// Full `CREATE OR REPLACE` statement from `pg_get_functiondef`
    pub definition: String,
}

impl Routine {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind, self.name.clone())
    }
}

/// A complete database schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Name of the database this schema was read from
    pub name: String,
    /// Tables in the schema, indexed by name
    pub tables: IndexMap<String, Arc<Table>>,
    /// Functions and procedures, indexed by name
    pub routines: IndexMap<String, Arc<Routine>>,
}

impl Schema {
    /// Create a new empty schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Get a table by name.
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    /// Iterate over all tables.
    pub fn iter_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values().map(|t| t.as_ref())
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn add_routine(&mut self, routine: Routine) {
        self.routines.insert(routine.name.clone(), Arc::new(routine));
    }

    /// Keys of every object in the schema, tables first.
    pub fn object_keys(&self) -> Vec<ObjectKey> {
        self.tables
            .values()
            .map(|t| t.key())
            .chain(self.routines.values().map(|r| r.key()))
            .collect()
    }

    pub fn has_object(&self, key: &ObjectKey) -> bool {
        match key.kind {
            ObjectType::Table => self.tables.contains_key(&key.name),
            kind => self
                .routines
                .get(&key.name)
                .is_some_and(|r| r.kind == kind),
        }
    }

    /// A copy under a different name, sharing every table and routine.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: self.tables.clone(),
            routines: self.routines.clone(),
        }
    }
}
