//! tally - a migration revision ledger for PostgreSQL.
//!
//! Records which migrations ran against a database, in what order and with
//! what outcome, in a schema of its own.

pub use tally_core::config::{DatabaseConfig, RevisionsConfig, TallyConfig};
pub use tally_core::error::{Operation, Result, StorageErrorKind, TallyError};
pub use tally_core::revision::{
    from_record, to_record, ExecutionState, LedgerContext, Revision, RevisionReadWriter,
    RevisionRecord, DEFAULT_REVISIONS_SCHEMA,
};
pub use tally_runtime::ledger::{is_internal_table, MemoryRevisions, PgRevisions};
pub use tally_runtime::migrations::{
    load_migrations_from_dir, MigrationExecutor, MigrationFile, MigrationStatus,
};
pub use tally_runtime::Database;
