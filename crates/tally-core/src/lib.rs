pub mod config;
pub mod error;
pub mod revision;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{DatabaseConfig, TallyConfig};
pub use error::{Operation, Result, StorageErrorKind, TallyError};
pub use revision::{
    ExecutionState, LedgerContext, Revision, RevisionReadWriter, DEFAULT_REVISIONS_SCHEMA,
};
