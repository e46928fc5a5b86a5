//! Schema directories: `.sql` files plus a `.skiff.styx` option file.
//!
//! Each `.sql` file is split into statements with the sqlparser tokenizer
//! (so semicolons inside strings, comments and `$$` bodies are left alone)
//! and each statement is classified:
//!
//! - `CREATE TABLE`, `CREATE [OR REPLACE] FUNCTION | PROCEDURE` are creates
//! - `ALTER TABLE`, `CREATE [UNIQUE] INDEX` are alters, run after every create
//! - anything else is ignored (and warned about by the workers)

mod config;

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use skiff_db_schema::{ObjectKey, ObjectType, SourceLocation};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, TokenWithLocation, Tokenizer, Word};

pub use config::{CONFIG_FILE, Config, ConfigError};

use crate::{Error, Result};

/// One classified statement from a `.sql` file.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The object this statement creates or alters
    pub object: ObjectKey,
    pub location: SourceLocation,
    /// Statement text without the trailing semicolon
    pub text: String,
}

/// A statement skiff does not manage.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredStatement {
    pub location: SourceLocation,
    pub text: String,
}

/// The desired schema of a directory, as statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicalSchema {
    pub creates: Vec<Statement>,
    pub alters: Vec<Statement>,
    pub ignored: Vec<IgnoredStatement>,
    /// Encoding for databases created from this schema
    pub charset: Option<String>,
    /// Collation (and ctype) for databases created from this schema
    pub collation: Option<String>,
}

impl LogicalSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `sql` (the content of `file`) and append its statements.
    ///
    /// Two creates for the same object are an error, reported with both
    /// locations.
    pub fn add_file(&mut self, file: &str, sql: &str) -> Result<()> {
        for raw in split_statements(file, sql)? {
            match raw.kind {
                Classified::Create(object) => {
                    if let Some(existing) = self.creates.iter().find(|s| s.object == object) {
                        return Err(Error::Config(format!(
                            "{} is defined more than once ({} and {})",
                            object, existing.location, raw.location
                        )));
                    }
                    self.creates.push(Statement {
                        object,
                        location: raw.location,
                        text: raw.text,
                    });
                }
                Classified::Alter(object) => self.alters.push(Statement {
                    object,
                    location: raw.location,
                    text: raw.text,
                }),
                Classified::Ignored => self.ignored.push(IgnoredStatement {
                    location: raw.location,
                    text: raw.text,
                }),
            }
        }
        Ok(())
    }

    /// Build from a single piece of SQL, mostly useful in tests.
    pub fn from_sql(file: &str, sql: &str) -> Result<Self> {
        let mut logical = Self::new();
        logical.add_file(file, sql)?;
        Ok(logical)
    }

    /// The CREATE statement for `key`, if any.
    pub fn create_for(&self, key: &ObjectKey) -> Option<&Statement> {
        self.creates.iter().find(|s| &s.object == key)
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.alters.is_empty()
    }
}

/// A schema directory.
#[derive(Debug, Clone)]
pub struct Dir {
    pub path: Utf8PathBuf,
    /// Options of this directory, laid over those of its parents
    pub config: Config,
    pub logical_schema: Arc<LogicalSchema>,
}

impl Dir {
    /// Load `path` on its own, without any parent options.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self> {
        Self::load_with_parent(path.as_ref(), &Config::new())
    }

    fn load_with_parent(path: &Utf8Path, parent: &Config) -> Result<Self> {
        let config = parent.overlay(&Config::load_dir(path)?);

        let mut files: Vec<Utf8PathBuf> = Vec::new();
        for entry in path.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_file() && entry.path().extension() == Some("sql") {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();

        let mut logical = LogicalSchema::new();
        for file in &files {
            let sql = std::fs::read_to_string(file)?;
            logical.add_file(file.as_str(), &sql)?;
        }
        logical.charset = config.get("default_charset").map(str::to_string);
        logical.collation = config.get("default_collation").map(str::to_string);

        Ok(Self {
            path: path.to_path_buf(),
            config,
            logical_schema: Arc::new(logical),
        })
    }

    /// Child directories, loaded with this directory's options as defaults.
    /// Hidden directories are skipped.
    pub fn subdirs(&self) -> Result<Vec<Dir>> {
        let mut paths = Vec::new();
        for entry in self.path.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && !entry.file_name().starts_with('.') {
                paths.push(entry.path().to_path_buf());
            }
        }
        paths.sort();
        paths
            .iter()
            .map(|p| Self::load_with_parent(p, &self.config))
            .collect()
    }

    /// Database names this directory maps to (the `schema` option).
    pub fn schema_names(&self) -> Vec<String> {
        self.config.get_list("schema")
    }
}

impl std::fmt::Display for Dir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Classified {
    Create(ObjectKey),
    Alter(ObjectKey),
    Ignored,
}

#[derive(Debug)]
struct RawStatement {
    location: SourceLocation,
    text: String,
    kind: Classified,
}

/// Split `sql` into statements and classify each one.
fn split_statements(file: &str, sql: &str) -> Result<Vec<RawStatement>> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| Error::Config(format!("{}: {}", file, e)))?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();

    let mut statements = Vec::new();
    let mut current: Vec<&TokenWithLocation> = Vec::new();

    let mut finish = |current: &mut Vec<&TokenWithLocation>, end: usize| {
        let Some(first) = current.first() else {
            return;
        };
        let start = byte_offset(sql, &line_starts, &first.location);
        let text = sql[start.min(end)..end].trim().to_string();
        let significant: Vec<&Token> = current.iter().map(|t| &t.token).collect();
        statements.push(RawStatement {
            location: SourceLocation::new(
                file,
                first.location.line as u32,
                first.location.column as u32,
            ),
            text,
            kind: classify(&significant),
        });
        current.clear();
    };

    for tok in &tokens {
        match &tok.token {
            Token::Whitespace(_) | Token::EOF => {}
            Token::SemiColon => {
                let end = byte_offset(sql, &line_starts, &tok.location);
                finish(&mut current, end);
            }
            _ => current.push(tok),
        }
    }
    finish(&mut current, sql.len());

    Ok(statements)
}

/// Byte offset of a 1-based line/column (in chars) location.
fn byte_offset(sql: &str, line_starts: &[usize], loc: &Location) -> usize {
    let line = (loc.line as usize).saturating_sub(1);
    let Some(&line_start) = line_starts.get(line) else {
        return sql.len();
    };
    let column = (loc.column as usize).saturating_sub(1);
    sql[line_start..]
        .char_indices()
        .nth(column)
        .map(|(i, _)| line_start + i)
        .unwrap_or(sql.len())
}

fn keyword<'a>(tokens: &[&'a Token], i: usize) -> Option<&'a str> {
    match tokens.get(i) {
        Some(Token::Word(Word {
            value,
            quote_style: None,
            ..
        })) => Some(value.as_str()),
        _ => None,
    }
}

fn is_kw(tokens: &[&Token], i: usize, kw: &str) -> bool {
    keyword(tokens, i).is_some_and(|w| w.eq_ignore_ascii_case(kw))
}

/// Skip `words` if they appear in sequence at `i`.
fn skip_seq(tokens: &[&Token], i: usize, words: &[&str]) -> usize {
    if words.iter().enumerate().all(|(n, w)| is_kw(tokens, i + n, w)) {
        i + words.len()
    } else {
        i
    }
}

/// Read a possibly schema-qualified name at `i` and return its last part.
fn object_name(tokens: &[&Token], mut i: usize) -> Option<String> {
    let mut name = None;
    while let Some(Token::Word(w)) = tokens.get(i) {
        name = Some(match w.quote_style {
            Some(_) => w.value.clone(),
            None => w.value.to_lowercase(),
        });
        if !matches!(tokens.get(i + 1), Some(Token::Period)) {
            break;
        }
        i += 2;
    }
    name
}

fn classify(tokens: &[&Token]) -> Classified {
    if is_kw(tokens, 0, "CREATE") {
        let mut i = skip_seq(tokens, 1, &["OR", "REPLACE"]);
        i = skip_seq(tokens, i, &["UNLOGGED"]);

        let create = |kind: ObjectType, at: usize| {
            object_name(tokens, at)
                .map(|name| Classified::Create(ObjectKey::new(kind, name)))
                .unwrap_or(Classified::Ignored)
        };

        if is_kw(tokens, i, "TABLE") {
            return create(ObjectType::Table, skip_seq(tokens, i + 1, &["IF", "NOT", "EXISTS"]));
        }
        if is_kw(tokens, i, "FUNCTION") {
            return create(ObjectType::Function, i + 1);
        }
        if is_kw(tokens, i, "PROCEDURE") {
            return create(ObjectType::Procedure, i + 1);
        }

        i = skip_seq(tokens, i, &["UNIQUE"]);
        if is_kw(tokens, i, "INDEX") {
            let Some(on) = (i + 1..tokens.len()).find(|&j| is_kw(tokens, j, "ON")) else {
                return Classified::Ignored;
            };
            let at = skip_seq(tokens, on + 1, &["ONLY"]);
            return object_name(tokens, at)
                .map(|name| Classified::Alter(ObjectKey::table(name)))
                .unwrap_or(Classified::Ignored);
        }
        return Classified::Ignored;
    }

    if is_kw(tokens, 0, "ALTER") && is_kw(tokens, 1, "TABLE") {
        let mut i = skip_seq(tokens, 2, &["IF", "EXISTS"]);
        i = skip_seq(tokens, i, &["ONLY"]);
        return object_name(tokens, i)
            .map(|name| Classified::Alter(ObjectKey::table(name)))
            .unwrap_or(Classified::Ignored);
    }

    Classified::Ignored
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQL: &str = r#"-- users and their posts
CREATE TABLE users (
    id bigint GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
    email text NOT NULL -- no ; here
);

CREATE TABLE IF NOT EXISTS public."Posts" (id bigint PRIMARY KEY, body text DEFAULT 'a;b');

CREATE OR REPLACE FUNCTION touch() RETURNS trigger LANGUAGE plpgsql AS $$
BEGIN
    NEW.updated_at := now();
    RETURN NEW;
END;
$$;

CREATE UNIQUE INDEX users_email_idx ON users (lower(email));
ALTER TABLE ONLY "Posts" ADD COLUMN author_id bigint;
INSERT INTO users (email) VALUES ('x');
CREATE PROCEDURE noop() LANGUAGE sql AS 'SELECT 1'
"#;

    #[test]
    fn test_split_and_classify() {
        let logical = LogicalSchema::from_sql("app.sql", SQL).unwrap();

        let creates: Vec<String> = logical.creates.iter().map(|s| s.object.to_string()).collect();
        assert_eq!(
            creates,
            vec![
                "table \"users\"",
                "table \"Posts\"",
                "function \"touch\"",
                "procedure \"noop\""
            ]
        );

        let alters: Vec<String> = logical.alters.iter().map(|s| s.object.to_string()).collect();
        assert_eq!(alters, vec!["table \"users\"", "table \"Posts\""]);

        assert_eq!(logical.ignored.len(), 1);
        assert!(logical.ignored[0].text.starts_with("INSERT INTO users"));
    }

    #[test]
    fn test_statement_text_and_location() {
        let logical = LogicalSchema::from_sql("app.sql", SQL).unwrap();

        let users = &logical.creates[0];
        assert_eq!(users.location.to_string(), "app.sql:2:1");
        assert!(users.text.starts_with("CREATE TABLE users ("));
        assert!(users.text.ends_with(')'));
        assert!(users.text.contains("-- no ; here"));

        let posts = &logical.creates[1];
        assert_eq!(posts.location.line, Some(7));
        assert!(posts.text.ends_with("DEFAULT 'a;b')"));

        let touch = &logical.creates[2];
        assert!(touch.text.contains("RETURN NEW;\nEND;"));
        assert!(touch.text.ends_with("$$"));

        // trailing statement without a semicolon
        assert_eq!(logical.creates[3].text, "CREATE PROCEDURE noop() LANGUAGE sql AS 'SELECT 1'");
    }

    #[test]
    fn test_duplicate_create_is_an_error() {
        let err = LogicalSchema::from_sql(
            "dup.sql",
            "CREATE TABLE a (id int);\nCREATE TABLE A (id bigint);",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "configuration error: table \"a\" is defined more than once (dup.sql:1:1 and dup.sql:2:1)"
        );
    }

    #[test]
    fn test_empty_input() {
        let logical = LogicalSchema::from_sql("empty.sql", "  -- nothing\n\n").unwrap();
        assert!(logical.is_empty());
        assert!(logical.ignored.is_empty());
    }
}
