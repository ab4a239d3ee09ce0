//! Applies migration files and records each attempt in a revision ledger.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use tally_core::error::{Operation, Result, TallyError};
use tally_core::revision::{ExecutionState, LedgerContext, Revision, RevisionReadWriter};

use super::loader::MigrationFile;

/// A statement of a migration that the database rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementError {
    /// Zero-based index of the failing statement.
    pub index: usize,
    pub message: String,
}

/// Database that migration statements run against.
pub trait MigrationTarget: Send + Sync {
    /// Run all statements of one migration, all or nothing.
    fn execute(
        &self,
        statements: &[String],
    ) -> impl Future<Output = std::result::Result<(), StatementError>> + Send;
}

impl MigrationTarget for PgPool {
    async fn execute(&self, statements: &[String]) -> std::result::Result<(), StatementError> {
        let mut tx = self.begin().await.map_err(|e| StatementError {
            index: 0,
            message: e.to_string(),
        })?;

        for (index, statement) in statements.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StatementError {
                    index,
                    message: e.to_string(),
                })?;
        }

        tx.commit().await.map_err(|e| StatementError {
            index: statements.len(),
            message: e.to_string(),
        })
    }
}

/// A migration recorded as applied whose file has changed since.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftedMigration {
    pub version: String,
    pub recorded: String,
    pub current: String,
}

/// Ledger history compared against the files on disk.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    /// Recorded `ok` with an unchanged file.
    pub applied: Vec<Revision>,
    /// On disk, never recorded.
    pub pending: Vec<String>,
    /// Recorded `ok`, file changed since.
    pub drifted: Vec<DriftedMigration>,
    /// Recorded in any state other than `ok`; retried on the next apply.
    pub failed: Vec<Revision>,
    /// Recorded, but no longer on disk.
    pub unknown: Vec<Revision>,
}

impl MigrationStatus {
    /// Compare `revisions` with `files`. Both are expected in version order.
    pub fn compare(revisions: Vec<Revision>, files: &[MigrationFile]) -> Self {
        let on_disk: BTreeMap<&str, &MigrationFile> =
            files.iter().map(|f| (f.version.as_str(), f)).collect();
        let recorded: HashSet<String> = revisions.iter().map(|r| r.version.clone()).collect();

        let mut status = MigrationStatus::default();
        for rev in revisions {
            match on_disk.get(rev.version.as_str()) {
                None => status.unknown.push(rev),
                Some(_) if rev.execution_state != ExecutionState::Ok => status.failed.push(rev),
                Some(file) if file.hash != rev.hash => status.drifted.push(DriftedMigration {
                    version: rev.version.clone(),
                    recorded: rev.hash.clone(),
                    current: file.hash.clone(),
                }),
                Some(_) => status.applied.push(rev),
            }
        }

        status.pending = files
            .iter()
            .filter(|f| !recorded.contains(&f.version))
            .map(|f| f.version.clone())
            .collect();

        status
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.failed.is_empty() && self.drifted.is_empty()
    }
}

/// Runs migration files in order, recording every attempt.
pub struct MigrationExecutor<L, T> {
    ledger: L,
    target: T,
    operator_version: String,
}

impl<L: RevisionReadWriter, T: MigrationTarget> MigrationExecutor<L, T> {
    pub fn new(ledger: L, target: T) -> Self {
        Self {
            ledger,
            target,
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Override the version recorded as the operator of each revision.
    pub fn with_operator_version(mut self, version: impl Into<String>) -> Self {
        self.operator_version = version.into();
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Compare recorded history with `files`. The ledger must be initialized.
    pub async fn status(
        &self,
        cx: &LedgerContext,
        files: &[MigrationFile],
    ) -> Result<MigrationStatus> {
        let revisions = self.ledger.read_revisions(cx).await?;
        Ok(MigrationStatus::compare(revisions, files))
    }

    /// Apply every file that is not recorded as `ok`, in order.
    ///
    /// Refuses to run when an applied file has drifted. Stops at the first
    /// failing migration, after recording it as `error`. Returns the versions
    /// applied by this call.
    pub async fn apply(&self, cx: &LedgerContext, files: &[MigrationFile]) -> Result<Vec<String>> {
        self.ledger.init(cx).await?;
        let status = self.status(cx, files).await?;

        if let Some(drift) = status.drifted.into_iter().next() {
            return Err(TallyError::Drift {
                version: drift.version,
                recorded: drift.recorded,
                current: drift.current,
            });
        }

        let done: HashSet<&str> = status.applied.iter().map(|r| r.version.as_str()).collect();
        let mut applied = Vec::new();

        // A cancelled context surfaces at the next migration's first ledger write.
        for file in files.iter().filter(|f| !done.contains(f.version.as_str())) {
            self.apply_one(cx, file).await?;
            applied.push(file.version.clone());
        }

        info!(count = applied.len(), "Migrations applied");
        Ok(applied)
    }

    async fn apply_one(&self, cx: &LedgerContext, file: &MigrationFile) -> Result<()> {
        let statements = file.statements();
        let mut revision = Revision::new(&file.version, &file.description)
            .with_state(ExecutionState::Ongoing)
            .with_executed_at(Utc::now())
            .with_hash(&file.hash)
            .with_operator_version(&self.operator_version);

        // Visible to other tools while the migration runs.
        self.ledger
            .write_revisions(cx, std::slice::from_ref(&revision))
            .await?;

        info!(version = %file.version, statements = statements.len(), "Applying migration");
        let start = Instant::now();
        // Cancelling drops the target's transaction, rolling the migration back.
        let outcome = cx
            .run(Operation::Migrate, self.ledger.namespace(), async {
                Ok::<_, TallyError>(self.target.execute(&statements).await)
            })
            .await;
        revision.execution_time = start.elapsed();

        // The outcome is recorded even when the caller has cancelled, so the
        // ledger never reports `ongoing` for a migration that finished.
        let record = LedgerContext::new();

        match outcome {
            Ok(Ok(())) => {
                revision.execution_state = ExecutionState::Ok;
                revision
                    .meta
                    .insert("applied_statements".into(), json!(statements.len()));
                self.ledger
                    .write_revisions(&record, std::slice::from_ref(&revision))
                    .await?;
                info!(
                    version = %file.version,
                    elapsed_ms = revision.execution_time.as_millis() as u64,
                    "Migration applied"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(version = %file.version, statement = e.index, error = %e.message, "Migration failed");
                revision.execution_state = ExecutionState::Error;
                revision.meta.insert("error".into(), json!(e.message));
                revision
                    .meta
                    .insert("failed_statement".into(), json!(e.index));
                self.ledger
                    .write_revisions(&record, std::slice::from_ref(&revision))
                    .await?;
                Err(TallyError::Migration {
                    version: file.version.clone(),
                    message: e.message,
                })
            }
            Err(interrupted) => {
                warn!(version = %file.version, error = %interrupted, "Migration interrupted");
                revision.execution_state = ExecutionState::Error;
                revision
                    .meta
                    .insert("error".into(), json!(interrupted.to_string()));
                self.ledger
                    .write_revisions(&record, std::slice::from_ref(&revision))
                    .await?;
                Err(interrupted)
            }
        }
    }
}
