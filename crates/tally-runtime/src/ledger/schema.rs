//! Bootstrap DDL and statements for the revision table.
//!
//! The table is tool-owned: it carries [`INTERNAL_TABLE_MARKER`] as its
//! comment so schema inspection can leave it out of user schema.

/// Name of the revision table inside the ledger's schema.
pub const REVISIONS_TABLE: &str = "tally_revisions";

/// Comment placed on the revision table.
pub const INTERNAL_TABLE_MARKER: &str = "tally:internal";

/// Whether a table comment marks the table as tool-owned.
pub fn is_internal_table(comment: Option<&str>) -> bool {
    comment.is_some_and(|c| c.trim() == INTERNAL_TABLE_MARKER)
}

/// Quote an identifier for Postgres.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Statements for one ledger schema, rendered once at construction.
#[derive(Debug, Clone)]
pub struct LedgerStatements {
    pub create_schema: String,
    pub create_table: String,
    pub comment_table: String,
    pub select_all: String,
    pub upsert: String,
}

impl LedgerStatements {
    pub fn new(namespace: &str) -> Self {
        let schema = quote_ident(namespace);
        let table = format!("{}.{}", schema, quote_ident(REVISIONS_TABLE));

        Self {
            create_schema: format!("CREATE SCHEMA IF NOT EXISTS {}", schema),
            create_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    version TEXT COLLATE "C" PRIMARY KEY,
                    description TEXT NOT NULL,
                    execution_state TEXT NOT NULL
                        CHECK (execution_state IN ('pending', 'ongoing', 'ok', 'error')),
                    executed_at TIMESTAMPTZ NOT NULL,
                    execution_time BIGINT NOT NULL CHECK (execution_time >= 0),
                    hash TEXT NOT NULL,
                    operator_version TEXT NOT NULL,
                    meta JSONB NOT NULL DEFAULT '{{}}'::jsonb
                )
                "#
            ),
            comment_table: format!(
                "COMMENT ON TABLE {} IS '{}'",
                table, INTERNAL_TABLE_MARKER
            ),
            select_all: format!(
                r#"
                SELECT version, description, execution_state, executed_at,
                       execution_time, hash, operator_version, meta
                FROM {table}
                ORDER BY version COLLATE "C" ASC
                "#
            ),
            upsert: format!(
                r#"
                INSERT INTO {table} (
                    version, description, execution_state, executed_at,
                    execution_time, hash, operator_version, meta
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (version) DO UPDATE SET
                    description = EXCLUDED.description,
                    execution_state = EXCLUDED.execution_state,
                    executed_at = EXCLUDED.executed_at,
                    execution_time = EXCLUDED.execution_time,
                    hash = EXCLUDED.hash,
                    operator_version = EXCLUDED.operator_version,
                    meta = EXCLUDED.meta
                "#
            ),
        }
    }
}
