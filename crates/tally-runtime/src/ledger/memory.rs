//! In-process ledger for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use tally_core::error::{Operation, Result, StorageErrorKind, TallyError};
use tally_core::revision::{
    from_record, resolve_namespace, to_record, LedgerContext, Revision, RevisionReadWriter,
    RevisionRecord,
};

/// Revision ledger held in memory.
///
/// Rows are kept in their stored form and mapped on every read, like the
/// Postgres ledger. Clones share the same state, standing in for several
/// ledger instances pointed at one schema.
#[derive(Clone)]
pub struct MemoryRevisions {
    namespace: String,
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    initialized: bool,
    init_calls: usize,
    rows: BTreeMap<String, RevisionRecord>,
    fail_on_version: Option<String>,
    latency: Duration,
}

impl MemoryRevisions {
    pub fn new(schema: &str) -> Result<Self> {
        Ok(Self {
            namespace: resolve_namespace(schema)?,
            state: Arc::new(RwLock::new(MemoryState::default())),
        })
    }

    /// Fail any write batch containing `version`, as a transient storage fault.
    pub async fn fail_writes_on(&self, version: impl Into<String>) {
        self.state.write().await.fail_on_version = Some(version.into());
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.fail_on_version = None;
    }

    /// Delay every operation, to exercise cancellation.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.write().await.latency = latency;
    }

    /// Number of `init` calls that reached storage.
    pub async fn init_calls(&self) -> usize {
        self.state.read().await.init_calls
    }

    /// Store a raw row, bypassing the mapping. Lets tests plant rows another
    /// tool may have written.
    pub async fn insert_record(&self, record: RevisionRecord) {
        self.state
            .write()
            .await
            .rows
            .insert(record.version.clone(), record);
    }

    async fn latency(&self) {
        let latency = self.state.read().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn structural(&self, operation: Operation, message: &str) -> TallyError {
        TallyError::Storage {
            operation,
            namespace: self.namespace.clone(),
            version: None,
            kind: StorageErrorKind::Structural,
            message: message.to_string(),
        }
    }

    async fn init_inner(&self) -> Result<()> {
        self.latency().await;
        let mut state = self.state.write().await;
        state.initialized = true;
        state.init_calls += 1;
        Ok(())
    }

    async fn read_inner(&self) -> Result<Vec<Revision>> {
        self.latency().await;
        let state = self.state.read().await;
        if !state.initialized {
            return Err(self.structural(Operation::Read, "revision table does not exist"));
        }

        // BTreeMap<String, _> iterates in byte-wise key order.
        state
            .rows
            .values()
            .map(|rec| {
                from_record(rec.clone()).map_err(|e| TallyError::Storage {
                    operation: Operation::Read,
                    namespace: self.namespace.clone(),
                    version: Some(rec.version.clone()),
                    kind: StorageErrorKind::Corrupt,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    async fn write_inner(&self, revisions: &[Revision]) -> Result<()> {
        self.latency().await;
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(self.structural(Operation::Write, "revision table does not exist"));
        }

        // Stage the batch and swap it in only when every row succeeded.
        let mut staged = state.rows.clone();
        for rev in revisions {
            if state.fail_on_version.as_deref() == Some(rev.version.as_str()) {
                return Err(TallyError::Storage {
                    operation: Operation::Write,
                    namespace: self.namespace.clone(),
                    version: Some(rev.version.clone()),
                    kind: StorageErrorKind::Transient,
                    message: "injected storage fault".into(),
                });
            }
            staged.insert(rev.version.clone(), to_record(rev));
        }
        state.rows = staged;
        Ok(())
    }
}

impl RevisionReadWriter for MemoryRevisions {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn init(&self, cx: &LedgerContext) -> Result<()> {
        cx.run(Operation::Init, &self.namespace, self.init_inner())
            .await
    }

    async fn read_revisions(&self, cx: &LedgerContext) -> Result<Vec<Revision>> {
        cx.run(Operation::Read, &self.namespace, self.read_inner())
            .await
    }

    async fn write_revisions(&self, cx: &LedgerContext, revisions: &[Revision]) -> Result<()> {
        if revisions.is_empty() {
            return Ok(());
        }
        for rev in revisions {
            rev.validate()?;
        }
        cx.run(Operation::Write, &self.namespace, self.write_inner(revisions))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::revision::{ExecutionState, DEFAULT_REVISIONS_SCHEMA};
    use tokio_util::sync::CancellationToken;

    fn revision(version: &str, state: ExecutionState) -> Revision {
        Revision::new(version, "test")
            .with_state(state)
            .with_hash(format!("h-{}", version))
            .with_operator_version("0.1.0")
    }

    fn versions(revs: &[Revision]) -> Vec<&str> {
        revs.iter().map(|r| r.version.as_str()).collect()
    }

    async fn ready_ledger() -> MemoryRevisions {
        let ledger = MemoryRevisions::new("").unwrap();
        ledger.init(&LedgerContext::new()).await.unwrap();
        ledger
    }

    #[test]
    fn test_default_namespace() {
        let ledger = MemoryRevisions::new("").unwrap();
        assert_eq!(ledger.namespace(), DEFAULT_REVISIONS_SCHEMA);
    }

    #[tokio::test]
    async fn test_init_twice() {
        let ledger = MemoryRevisions::new("ns").unwrap();
        let cx = LedgerContext::new();
        ledger.init(&cx).await.unwrap();
        ledger
            .write_revisions(&cx, &[revision("1_init", ExecutionState::Ok)])
            .await
            .unwrap();
        ledger.init(&cx).await.unwrap();

        assert_eq!(ledger.init_calls().await, 2);
        // A second init leaves stored history alone.
        assert_eq!(ledger.read_revisions(&cx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_read() {
        let ledger = ready_ledger().await;
        let revs = ledger.read_revisions(&LedgerContext::new()).await.unwrap();
        assert!(revs.is_empty());
    }

    #[tokio::test]
    async fn test_read_before_init_fails() {
        let ledger = MemoryRevisions::new("").unwrap();
        let err = ledger
            .read_revisions(&LedgerContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.storage_kind(), Some(StorageErrorKind::Structural));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_after_write_sorted() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        let r1 = revision("1", ExecutionState::Ok);
        let r2 = revision("2", ExecutionState::Ok);

        ledger
            .write_revisions(&cx, &[r2.clone(), r1.clone()])
            .await
            .unwrap();

        assert_eq!(ledger.read_revisions(&cx).await.unwrap(), vec![r1, r2]);
    }

    #[tokio::test]
    async fn test_versions_sort_bytewise() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        ledger
            .write_revisions(
                &cx,
                &[
                    revision("2_y", ExecutionState::Ok),
                    revision("1_z", ExecutionState::Ok),
                    revision("10_x", ExecutionState::Ok),
                ],
            )
            .await
            .unwrap();

        let revs = ledger.read_revisions(&cx).await.unwrap();
        // "10_x" < "1_z" because '0' (0x30) < '_' (0x5f).
        assert_eq!(versions(&revs), vec!["10_x", "1_z", "2_y"]);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        ledger
            .write_revisions(&cx, &[revision("1_init", ExecutionState::Ok)])
            .await
            .unwrap();

        let failed = revision("1_init", ExecutionState::Error)
            .with_hash("other")
            .with_meta("error", json!("syntax error"));
        ledger
            .write_revisions(&cx, &[failed.clone()])
            .await
            .unwrap();

        let revs = ledger.read_revisions(&cx).await.unwrap();
        assert_eq!(revs, vec![failed]);
    }

    #[tokio::test]
    async fn test_duplicate_in_batch_last_wins() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        let ongoing = revision("1_init", ExecutionState::Ongoing);
        let done = revision("1_init", ExecutionState::Ok);

        ledger
            .write_revisions(&cx, &[ongoing, done.clone()])
            .await
            .unwrap();
        assert_eq!(ledger.read_revisions(&cx).await.unwrap(), vec![done]);
    }

    #[tokio::test]
    async fn test_ongoing_state_is_stored() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        let ongoing = revision("1_init", ExecutionState::Ongoing);
        ledger
            .write_revisions(&cx, &[ongoing.clone()])
            .await
            .unwrap();
        assert_eq!(ledger.read_revisions(&cx).await.unwrap(), vec![ongoing]);
    }

    #[tokio::test]
    async fn test_failed_batch_persists_nothing() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        ledger.fail_writes_on("3_c").await;

        let err = ledger
            .write_revisions(
                &cx,
                &[
                    revision("1_a", ExecutionState::Ok),
                    revision("2_b", ExecutionState::Ok),
                    revision("3_c", ExecutionState::Ok),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("'3_c'"));

        assert!(ledger.read_revisions(&cx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_previous_values() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        let original = revision("1_a", ExecutionState::Ok);
        ledger
            .write_revisions(&cx, &[original.clone()])
            .await
            .unwrap();

        ledger.fail_writes_on("2_b").await;
        let result = ledger
            .write_revisions(
                &cx,
                &[
                    revision("1_a", ExecutionState::Error),
                    revision("2_b", ExecutionState::Ok),
                ],
            )
            .await;
        assert!(result.is_err());
        assert_eq!(
            ledger.read_revisions(&cx).await.unwrap(),
            vec![original.clone()]
        );

        ledger.clear_faults().await;
        ledger
            .write_revisions(&cx, &[revision("2_b", ExecutionState::Ok)])
            .await
            .unwrap();
        assert_eq!(ledger.read_revisions(&cx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_write_is_noop() {
        // Not initialized: any real write would fail.
        let ledger = MemoryRevisions::new("").unwrap();
        ledger
            .write_revisions(&LedgerContext::new(), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_write_persists_nothing() {
        let ledger = ready_ledger().await;
        ledger.set_latency(Duration::from_secs(30)).await;

        let token = CancellationToken::new();
        let cx = LedgerContext::with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = ledger
            .write_revisions(&cx, &[revision("1_a", ExecutionState::Ok)])
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(err.is_cancelled());

        ledger.set_latency(Duration::ZERO).await;
        let revs = ledger
            .read_revisions(&LedgerContext::new())
            .await
            .unwrap();
        assert!(revs.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_row_fails_whole_read() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        ledger
            .write_revisions(&cx, &[revision("1_a", ExecutionState::Ok)])
            .await
            .unwrap();

        let mut bad = to_record(&revision("2_b", ExecutionState::Ok));
        bad.execution_state = "exploded".into();
        ledger.insert_record(bad).await;

        let err = ledger.read_revisions(&cx).await.unwrap_err();
        assert_eq!(err.storage_kind(), Some(StorageErrorKind::Corrupt));
        assert!(err.to_string().contains("'2_b'"));
    }

    #[tokio::test]
    async fn test_nul_in_batch_rejected_before_storage() {
        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();

        let err = ledger
            .write_revisions(
                &cx,
                &[
                    revision("1_a", ExecutionState::Ok),
                    revision("2_b", ExecutionState::Error).with_meta("error", json!("a\u{0}b")),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::InvalidArgument(_)));
        assert!(ledger.read_revisions(&cx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_executed_at_read_back_at_microseconds() {
        use chrono::{TimeZone, Utc};

        let ledger = ready_ledger().await;
        let cx = LedgerContext::new();
        let mut rev = revision("1_a", ExecutionState::Ok);
        rev.executed_at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();

        ledger.write_revisions(&cx, &[rev.clone()]).await.unwrap();
        let read = ledger.read_revisions(&cx).await.unwrap();
        assert_eq!(
            read[0].executed_at,
            Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap()
        );

        // Revisions built through the constructor read back unchanged.
        let fresh = revision("2_b", ExecutionState::Ok);
        ledger.write_revisions(&cx, &[fresh.clone()]).await.unwrap();
        assert_eq!(ledger.read_revisions(&cx).await.unwrap()[1], fresh);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = ready_ledger().await;
        let b = a.clone();
        let cx = LedgerContext::new();

        a.write_revisions(&cx, &[revision("1_a", ExecutionState::Ok)])
            .await
            .unwrap();
        b.write_revisions(&cx, &[revision("1_a", ExecutionState::Error)])
            .await
            .unwrap();

        let revs = a.read_revisions(&cx).await.unwrap();
        assert_eq!(revs.len(), 1);
        assert_eq!(revs[0].execution_state, ExecutionState::Error);
    }
}
