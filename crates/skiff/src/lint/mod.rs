//! Lints for desired schemas.
//!
//! Each rule is in its own module. Rules look at the tables a workspace
//! produced and report annotations located at the CREATE statement that
//! defined the table. How loud each rule is comes from the directory config
//! (`lint_pk`, `lint_dupe_index`, `lint_float`).

mod dupe_index;
mod float;
mod pk;

use std::collections::HashSet;
use std::fmt;

use regex::Regex;
use skiff_db_schema::{ObjectKey, ObjectType, SourceLocation, Table};

use crate::fs::{ConfigError, Dir};
use crate::workspace::WorkspaceSchema;

pub use dupe_index::lint_dupe_index;
pub use float::lint_float;
pub use pk::lint_pk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Ignore,
    Warning,
    Error,
}

impl Severity {
    const NAMES: [&'static str; 3] = ["ignore", "warning", "error"];

    fn from_config(dir: &Dir, key: &str, default: Severity) -> Result<Severity, ConfigError> {
        if dir.config.get(key).is_none() {
            return Ok(default);
        }
        Ok(match dir.config.get_enum(key, &Self::NAMES)?.as_str() {
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            _ => Severity::Ignore,
        })
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Ignore => write!(f, "ignore"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub rule: &'static str,
    pub severity: Severity,
    pub key: ObjectKey,
    pub location: SourceLocation,
    pub message: String,
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}] {}", self.location, self.rule, self.message)
    }
}

/// Which rules run, how loud they are and which objects they look at.
#[derive(Debug, Clone)]
pub struct LintOptions {
    pub pk: Severity,
    pub dupe_index: Severity,
    pub float: Severity,
    /// When set, only these objects are checked.
    pub only_keys: Option<HashSet<ObjectKey>>,
    pub ignore_keys: HashSet<ObjectKey>,
    pub ignore_table: Option<Regex>,
}

impl Default for LintOptions {
    fn default() -> Self {
        Self {
            pk: Severity::Warning,
            dupe_index: Severity::Warning,
            float: Severity::Ignore,
            only_keys: None,
            ignore_keys: HashSet::new(),
            ignore_table: None,
        }
    }
}

impl LintOptions {
    pub fn for_dir(dir: &Dir) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            pk: Severity::from_config(dir, "lint_pk", defaults.pk)?,
            dupe_index: Severity::from_config(dir, "lint_dupe_index", defaults.dupe_index)?,
            float: Severity::from_config(dir, "lint_float", defaults.float)?,
            ignore_table: dir.config.get_regex("ignore_table")?,
            ..defaults
        })
    }

    /// Restrict checks to `keys`.
    pub fn only_keys(mut self, keys: impl IntoIterator<Item = ObjectKey>) -> Self {
        self.only_keys = Some(keys.into_iter().collect());
        self
    }

    fn should_ignore(&self, key: &ObjectKey) -> bool {
        if let Some(only) = &self.only_keys
            && !only.contains(key)
        {
            return true;
        }
        if self.ignore_keys.contains(key) {
            return true;
        }
        key.kind == ObjectType::Table
            && self
                .ignore_table
                .as_ref()
                .is_some_and(|re| re.is_match(&key.name))
    }
}

/// The findings for a schema.
#[derive(Debug, Clone, Default)]
pub struct LintResult {
    pub annotations: Vec<Annotation>,
    pub error_count: usize,
    pub warning_count: usize,
}

impl LintResult {
    /// Order annotations by file, then position.
    pub fn sort_by_file(&mut self) {
        self.annotations.sort_by(|a, b| {
            (&a.location.file, a.location.line, a.location.column)
                .cmp(&(&b.location.file, b.location.line, b.location.column))
                .then_with(|| a.rule.cmp(b.rule))
        });
    }

    pub fn is_clean(&self) -> bool {
        self.annotations.is_empty()
    }
}

/// Builder for creating annotations with less boilerplate.
pub struct AnnotationBuilder {
    rule: &'static str,
    severity: Severity,
    message: String,
}

impl AnnotationBuilder {
    pub fn new(rule: &'static str, severity: Severity) -> Self {
        Self {
            rule,
            severity,
            message: String::new(),
        }
    }

    pub fn msg(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Record the annotation against the table being checked. Ignored rules
    /// emit nothing.
    pub fn emit(self, ctx: &mut LintContext<'_>) {
        match self.severity {
            Severity::Ignore => return,
            Severity::Warning => ctx.result.warning_count += 1,
            Severity::Error => ctx.result.error_count += 1,
        }
        ctx.result.annotations.push(Annotation {
            rule: self.rule,
            severity: self.severity,
            key: ctx.table.key(),
            location: ctx.location.clone(),
            message: self.message,
        });
    }
}

/// Context passed to lints.
pub struct LintContext<'a> {
    pub table: &'a Table,
    pub location: SourceLocation,
    pub options: &'a LintOptions,
    pub result: &'a mut LintResult,
}

/// Run every enabled rule against the tables of `ws`.
pub fn check_schema(ws: &WorkspaceSchema, opts: &LintOptions) -> LintResult {
    let mut result = LintResult::default();
    for table in ws.schema.iter_tables() {
        let key = table.key();
        if opts.should_ignore(&key) {
            continue;
        }
        let location = ws
            .logical_schema
            .create_for(&key)
            .map(|stmt| stmt.location.clone())
            .unwrap_or_default();
        let mut ctx = LintContext {
            table,
            location,
            options: opts,
            result: &mut result,
        };
        lint_pk(&mut ctx);
        lint_dupe_index(&mut ctx);
        lint_float(&mut ctx);
    }
    result
}

#[cfg(test)]
mod tests;
