pub mod db;
pub mod ledger;
pub mod migrations;

pub use db::Database;
pub use ledger::{MemoryRevisions, PgRevisions};
pub use migrations::{load_migrations_from_dir, MigrationExecutor, MigrationFile, MigrationStatus};
