//! Migration files on disk.

use std::ffi::OsStr;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use tally_core::error::{Result, TallyError};

/// A single migration file.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationFile {
    /// File stem, e.g. "20240101120000_create_users".
    pub version: String,
    /// Part of the stem after the first underscore.
    pub description: String,
    pub sql: String,
    /// SHA-256 of `sql`, hex encoded.
    pub hash: String,
}

impl MigrationFile {
    pub fn new(version: impl Into<String>, sql: impl Into<String>) -> Self {
        let version = version.into();
        let sql = sql.into();
        Self {
            description: describe(&version),
            hash: compute_checksum(&sql),
            version,
            sql,
        }
    }

    /// Executable statements in file order.
    pub fn statements(&self) -> Vec<String> {
        split_sql_statements(&self.sql)
    }
}

fn describe(version: &str) -> String {
    match version.split_once('_') {
        Some((_, rest)) => rest.replace('_', " "),
        None => String::new(),
    }
}

/// Compute SHA256 checksum of SQL content.
pub fn compute_checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lexical context of the splitter.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Scan {
    Code,
    /// `'...'`; `backslash` is set for `E'...'` strings.
    Literal { backslash: bool },
    /// `"..."`
    QuotedIdent,
    LineComment,
    /// Postgres block comments nest.
    BlockComment { depth: u32 },
    /// Inside `$tag$ ... $tag$`; the tag is `chars[start..start + len]`.
    DollarQuoted { start: usize, len: usize },
}

/// Split SQL into statements on top-level semicolons.
///
/// Semicolons inside string literals, quoted identifiers, comments and
/// dollar-quoted bodies do not end a statement. Chunks holding only
/// whitespace and comments are dropped; comments inside a statement are kept.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut stmt_start = 0;
    let mut has_code = false;
    let mut scan = Scan::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match scan {
            Scan::Code => match c {
                ';' => {
                    if has_code {
                        push_statement(&mut statements, &chars[stmt_start..i]);
                    }
                    stmt_start = i + 1;
                    has_code = false;
                }
                '-' if next == Some('-') => {
                    scan = Scan::LineComment;
                    i += 1;
                }
                '/' if next == Some('*') => {
                    scan = Scan::BlockComment { depth: 1 };
                    i += 1;
                }
                '\'' => {
                    has_code = true;
                    scan = Scan::Literal {
                        backslash: is_escape_string_prefix(&chars, i),
                    };
                }
                '"' => {
                    has_code = true;
                    scan = Scan::QuotedIdent;
                }
                '$' => {
                    has_code = true;
                    if let Some(len) = dollar_tag_len(&chars, i) {
                        scan = Scan::DollarQuoted { start: i, len };
                        i += len - 1;
                    }
                }
                c if c.is_whitespace() => {}
                _ => has_code = true,
            },
            Scan::Literal { backslash } => match c {
                '\\' if backslash => i += 1,
                '\'' if next == Some('\'') => i += 1,
                '\'' => scan = Scan::Code,
                _ => {}
            },
            Scan::QuotedIdent => match c {
                '"' if next == Some('"') => i += 1,
                '"' => scan = Scan::Code,
                _ => {}
            },
            Scan::LineComment => {
                if c == '\n' {
                    scan = Scan::Code;
                }
            }
            Scan::BlockComment { depth } => {
                if c == '*' && next == Some('/') {
                    scan = if depth == 1 {
                        Scan::Code
                    } else {
                        Scan::BlockComment { depth: depth - 1 }
                    };
                    i += 1;
                } else if c == '/' && next == Some('*') {
                    scan = Scan::BlockComment { depth: depth + 1 };
                    i += 1;
                }
            }
            Scan::DollarQuoted { start, len } => {
                if c == '$' && chars[i..].starts_with(&chars[start..start + len]) {
                    scan = Scan::Code;
                    i += len - 1;
                }
            }
        }
        i += 1;
    }

    if has_code {
        push_statement(&mut statements, &chars[stmt_start..]);
    }
    statements
}

fn push_statement(statements: &mut Vec<String>, chars: &[char]) {
    let stmt: String = chars.iter().collect();
    statements.push(stmt.trim().to_string());
}

/// `E'...'` and `e'...'` literals treat backslash as an escape.
fn is_escape_string_prefix(chars: &[char], quote: usize) -> bool {
    match quote.checked_sub(1).map(|p| chars[p]) {
        Some('E' | 'e') => quote
            .checked_sub(2)
            .map_or(true, |p| !is_ident_char(chars[p])),
        _ => false,
    }
}

/// Length of the `$tag$` opening at `at`, if one does. `$1` parameters and
/// `$` inside identifiers are not tags.
fn dollar_tag_len(chars: &[char], at: usize) -> Option<usize> {
    if at > 0 && is_ident_char(chars[at - 1]) {
        return None;
    }
    let mut end = at + 1;
    match chars.get(end) {
        Some('$') => return Some(2),
        Some(c) if c.is_alphabetic() || *c == '_' => {}
        _ => return None,
    }
    while let Some(&c) = chars.get(end) {
        if c == '$' {
            return Some(end - at + 1);
        }
        if !is_ident_char(c) {
            return None;
        }
        end += 1;
    }
    None
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Read every `*.sql` file in `dir` as a migration named after its stem.
///
/// Results are in byte-wise version order. A missing directory yields no
/// migrations.
pub fn load_migrations_from_dir(dir: &Path) -> Result<Vec<MigrationFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "No migrations directory");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension() != Some(OsStr::new("sql")) {
            continue;
        }
        let Some(version) = path.file_stem().and_then(OsStr::to_str) else {
            return Err(TallyError::Config(format!(
                "migration file name is not valid UTF-8: {}",
                path.display()
            )));
        };
        let sql = std::fs::read_to_string(&path)?;
        files.push(MigrationFile::new(version, sql));
    }

    files.sort_unstable_by(|a, b| a.version.as_bytes().cmp(b.version.as_bytes()));
    debug!(dir = %dir.display(), count = files.len(), "Loaded migration files");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, sql: &str) {
        fs::write(dir.path().join(name), sql).unwrap();
    }

    #[test]
    fn test_missing_or_empty_dir_has_no_migrations() {
        let dir = TempDir::new().unwrap();
        assert!(load_migrations_from_dir(dir.path()).unwrap().is_empty());
        assert!(load_migrations_from_dir(&dir.path().join("absent"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_loaded_in_bytewise_order() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2_y.sql", "SELECT 2;");
        write(&dir, "10_x.sql", "SELECT 10;");
        write(&dir, "1_z.sql", "SELECT 1;");

        let loaded = load_migrations_from_dir(dir.path()).unwrap();
        let versions: Vec<_> = loaded.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["10_x", "1_z", "2_y"]);
        assert_eq!(loaded[0].hash, compute_checksum("SELECT 10;"));
    }

    #[test]
    fn test_only_sql_files_are_migrations() {
        let dir = TempDir::new().unwrap();
        write(&dir, "20240101_add_orders.sql", "CREATE TABLE orders (id INT);");
        write(&dir, "notes.md", "# not sql");
        write(&dir, "20240102_old.sql.orig", "SELECT 1;");
        fs::create_dir(dir.path().join("20240103_dir.sql")).unwrap();

        let loaded = load_migrations_from_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version, "20240101_add_orders");
        assert_eq!(loaded[0].description, "add orders");
    }

    #[test]
    fn test_description_from_version() {
        assert_eq!(
            MigrationFile::new("20240101_create_users", "").description,
            "create users"
        );
        assert_eq!(MigrationFile::new("20240101", "").description, "");
    }

    #[test]
    fn test_checksum() {
        let checksum = compute_checksum("CREATE TABLE users (id UUID);");
        assert_eq!(checksum.len(), 64);
        assert_ne!(checksum, compute_checksum("CREATE TABLE posts (id UUID);"));
        assert_eq!(
            compute_checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_split_plain_statements() {
        assert_eq!(
            split_sql_statements("SELECT 1;SELECT 2;\n\nSELECT 3"),
            vec!["SELECT 1", "SELECT 2", "SELECT 3"]
        );
        assert!(split_sql_statements(" ;; \n").is_empty());
    }

    #[test]
    fn test_split_keeps_semicolons_in_literals_and_comments() {
        let sql = "INSERT INTO notes (body) VALUES ('a;b');\n-- drop; later\nSELECT 1;";
        assert_eq!(
            split_sql_statements(sql),
            vec![
                "INSERT INTO notes (body) VALUES ('a;b')",
                "-- drop; later\nSELECT 1",
            ]
        );
    }

    #[test]
    fn test_split_doubled_quotes() {
        let sql = r#"INSERT INTO t VALUES ('it''s; fine'); CREATE TABLE "odd;""name" (id INT);"#;
        assert_eq!(
            split_sql_statements(sql),
            vec![
                "INSERT INTO t VALUES ('it''s; fine')",
                r#"CREATE TABLE "odd;""name" (id INT)"#,
            ]
        );
    }

    #[test]
    fn test_split_escape_string() {
        let sql = r"SELECT E'a\';b'; SELECT 'c\'; SELECT 2";
        assert_eq!(
            split_sql_statements(sql),
            vec![r"SELECT E'a\';b'", r"SELECT 'c\'", "SELECT 2"]
        );
    }

    #[test]
    fn test_split_nested_block_comment() {
        let sql = "/* outer; /* inner; */ still; */ SELECT 1; /* tail; */";
        assert_eq!(
            split_sql_statements(sql),
            vec!["/* outer; /* inner; */ still; */ SELECT 1"]
        );
    }

    #[test]
    fn test_split_dollar_quoted_bodies() {
        let sql = r#"
CREATE FUNCTION touch() RETURNS trigger AS $$
BEGIN
    NEW.updated_at := now();
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DO $body$ BEGIN PERFORM 'x;$$'; END $body$;
"#;
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("$$ LANGUAGE plpgsql"));
        assert_eq!(stmts[1], "DO $body$ BEGIN PERFORM 'x;$$'; END $body$");
    }

    #[test]
    fn test_split_positional_parameter_is_not_a_tag() {
        let sql = "PREPARE q AS SELECT $1; EXECUTE q(1);";
        assert_eq!(
            split_sql_statements(sql),
            vec!["PREPARE q AS SELECT $1", "EXECUTE q(1)"]
        );
    }

    #[test]
    fn test_statements_skip_comment_only_chunks() {
        let m = MigrationFile::new(
            "1_init",
            "-- header; with semicolon\n;\nCREATE TABLE t (id INT);\n/* trailer */",
        );
        assert_eq!(m.statements(), vec!["CREATE TABLE t (id INT)"]);
    }
}
