use std::future::Future;

use super::{LedgerContext, Revision};
use crate::error::Result;

/// Read/write access to a revision ledger.
///
/// This is the whole contract a migration engine depends on.
pub trait RevisionReadWriter: Send + Sync {
    /// Schema the ledger lives in.
    fn namespace(&self) -> &str;

    /// Make sure the ledger's schema and table exist. Idempotent.
    fn init(&self, cx: &LedgerContext) -> impl Future<Output = Result<()>> + Send;

    /// All stored revisions, ascending by version (byte-wise).
    fn read_revisions(&self, cx: &LedgerContext)
        -> impl Future<Output = Result<Vec<Revision>>> + Send;

    /// Upsert `revisions` by version in one atomic batch.
    fn write_revisions(
        &self,
        cx: &LedgerContext,
        revisions: &[Revision],
    ) -> impl Future<Output = Result<()>> + Send;
}
