//! Revision ledger backends.

mod memory;
mod postgres;
pub mod schema;

pub use memory::MemoryRevisions;
pub use postgres::PgRevisions;
pub use schema::{is_internal_table, INTERNAL_TABLE_MARKER, REVISIONS_TABLE};
