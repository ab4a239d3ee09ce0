mod executor;
mod loader;

pub use executor::{
    DriftedMigration, MigrationExecutor, MigrationStatus, MigrationTarget, StatementError,
};
pub use loader::{compute_checksum, load_migrations_from_dir, split_sql_statements, MigrationFile};
