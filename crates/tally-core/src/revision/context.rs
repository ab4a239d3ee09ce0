use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Operation, Result, TallyError};

/// Per-call context for ledger operations.
///
/// Carries the caller's cancellation token and an optional deadline. An
/// operation that is cancelled or runs past its deadline is abandoned and its
/// future dropped; a write transaction dropped this way is rolled back.
#[derive(Debug, Clone, Default)]
pub struct LedgerContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl LedgerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a token owned by the caller.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Abort operations that have not finished within `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self, operation: Operation, namespace: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TallyError::Cancelled {
                operation,
                namespace: namespace.to_string(),
            });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TallyError::Timeout {
                operation,
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first.
    pub async fn run<T, F>(&self, operation: Operation, namespace: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation, namespace)?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(%operation, namespace, "Ledger operation cancelled");
                Err(TallyError::Cancelled {
                    operation,
                    namespace: namespace.to_string(),
                })
            }
            _ = expired => {
                tracing::debug!(%operation, namespace, "Ledger operation timed out");
                Err(TallyError::Timeout {
                    operation,
                    namespace: namespace.to_string(),
                })
            }
            result = fut => result,
        }
    }
}
