use std::time::Instant;

use sqlx::PgPool;
use tracing::{debug, info};

use tally_core::error::{Operation, Result, StorageErrorKind, TallyError};
use tally_core::revision::{
    from_record, resolve_namespace, to_record, LedgerContext, Revision, RevisionReadWriter,
    RevisionRecord,
};

use super::schema::LedgerStatements;
use crate::db::Database;

/// Revision ledger stored in a dedicated Postgres schema.
pub struct PgRevisions {
    pool: PgPool,
    namespace: String,
    statements: LedgerStatements,
}

impl PgRevisions {
    /// Open a ledger in `schema` (empty selects the default) on a pool derived
    /// from `db`. Nothing is created until [`RevisionReadWriter::init`].
    pub async fn connect(db: &Database, schema: &str) -> Result<Self> {
        let namespace = resolve_namespace(schema)?;
        let pool = db
            .scoped_pool(&namespace)
            .await
            .map_err(|e| TallyError::Connection {
                namespace: namespace.clone(),
                message: e.to_string(),
            })?;

        debug!(namespace = %namespace, "Revision ledger connected");
        Ok(Self::with_namespace(pool, namespace))
    }

    /// Wrap an existing pool. No I/O is performed.
    pub fn from_pool(pool: PgPool, schema: &str) -> Result<Self> {
        let namespace = resolve_namespace(schema)?;
        Ok(Self::with_namespace(pool, namespace))
    }

    fn with_namespace(pool: PgPool, namespace: String) -> Self {
        Self {
            pool,
            statements: LedgerStatements::new(&namespace),
            namespace,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn storage_err(&self, operation: Operation, err: sqlx::Error) -> TallyError {
        TallyError::storage(operation, &self.namespace, err)
    }

    async fn init_inner(&self) -> Result<()> {
        let op = Operation::Init;
        let mut tx = self.pool.begin().await.map_err(|e| self.storage_err(op, e))?;

        // Concurrent CREATE ... IF NOT EXISTS can still collide on the catalog.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.namespace)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.storage_err(op, e))?;

        for sql in [
            &self.statements.create_schema,
            &self.statements.create_table,
            &self.statements.comment_table,
        ] {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.storage_err(op, e))?;
        }

        tx.commit().await.map_err(|e| self.storage_err(op, e))?;
        Ok(())
    }

    async fn read_inner(&self) -> Result<Vec<Revision>> {
        let records: Vec<RevisionRecord> = sqlx::query_as(&self.statements.select_all)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.storage_err(Operation::Read, e))?;

        records
            .into_iter()
            .map(|rec| {
                let version = rec.version.clone();
                from_record(rec).map_err(|e| TallyError::Storage {
                    operation: Operation::Read,
                    namespace: self.namespace.clone(),
                    version: Some(version),
                    kind: StorageErrorKind::Corrupt,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    async fn write_inner(&self, revisions: &[Revision]) -> Result<()> {
        let op = Operation::Write;
        let mut tx = self.pool.begin().await.map_err(|e| self.storage_err(op, e))?;

        for rev in revisions {
            let rec = to_record(rev);
            sqlx::query(&self.statements.upsert)
                .bind(&rec.version)
                .bind(&rec.description)
                .bind(&rec.execution_state)
                .bind(rec.executed_at)
                .bind(rec.execution_time)
                .bind(&rec.hash)
                .bind(&rec.operator_version)
                .bind(&rec.meta)
                .execute(&mut *tx)
                .await
                .map_err(|e| self.storage_err(op, e).with_version(&rev.version))?;
        }

        // Dropping `tx` on an early return rolls the whole batch back.
        tx.commit().await.map_err(|e| self.storage_err(op, e))?;
        Ok(())
    }
}

impl RevisionReadWriter for PgRevisions {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn init(&self, cx: &LedgerContext) -> Result<()> {
        cx.run(Operation::Init, &self.namespace, self.init_inner())
            .await?;
        info!(namespace = %self.namespace, "Revision ledger initialized");
        Ok(())
    }

    async fn read_revisions(&self, cx: &LedgerContext) -> Result<Vec<Revision>> {
        let revisions = cx
            .run(Operation::Read, &self.namespace, self.read_inner())
            .await?;
        debug!(
            namespace = %self.namespace,
            count = revisions.len(),
            "Read revisions"
        );
        Ok(revisions)
    }

    async fn write_revisions(&self, cx: &LedgerContext, revisions: &[Revision]) -> Result<()> {
        if revisions.is_empty() {
            return Ok(());
        }
        for rev in revisions {
            rev.validate()?;
        }

        let start = Instant::now();
        cx.run(Operation::Write, &self.namespace, self.write_inner(revisions))
            .await?;
        debug!(
            namespace = %self.namespace,
            count = revisions.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Wrote revisions"
        );
        Ok(())
    }
}
