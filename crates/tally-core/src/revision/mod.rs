//! Revision history types shared by every ledger backend.

mod context;
mod record;
mod state;
mod traits;

pub use context::LedgerContext;
pub use record::{from_record, to_record, RecordError, RevisionRecord};
pub use state::ExecutionState;
pub use traits::RevisionReadWriter;

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TallyError};

/// Schema used for the revision table when none is configured.
pub const DEFAULT_REVISIONS_SCHEMA: &str = "tally_schema_revisions";

/// Postgres truncates identifiers longer than this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Fractional second digits kept for `executed_at` (Postgres `TIMESTAMPTZ`).
pub const TIMESTAMP_PRECISION: u16 = 6;

/// One historical record of a single migration's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Unique, sortable migration identifier (e.g. "20240101120000_init").
    pub version: String,
    pub description: String,
    pub execution_state: ExecutionState,
    /// When execution started. Stored with microsecond precision.
    pub executed_at: DateTime<Utc>,
    pub execution_time: Duration,
    /// Checksum of the migration file at execution time.
    pub hash: String,
    /// Version of the tool that performed the execution.
    pub operator_version: String,
    /// Free-form data, opaque to the ledger.
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl Revision {
    /// Create a pending revision starting now.
    pub fn new(version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            execution_state: ExecutionState::Pending,
            executed_at: Utc::now().trunc_subsecs(TIMESTAMP_PRECISION),
            execution_time: Duration::ZERO,
            hash: String::new(),
            operator_version: String::new(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_state(mut self, state: ExecutionState) -> Self {
        self.execution_state = state;
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    pub fn with_operator_version(mut self, version: impl Into<String>) -> Self {
        self.operator_version = version.into();
        self
    }

    /// Set the start time, truncated to microseconds.
    pub fn with_executed_at(mut self, at: DateTime<Utc>) -> Self {
        self.executed_at = at.trunc_subsecs(TIMESTAMP_PRECISION);
        self
    }

    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Reject values no backend can store. Postgres refuses NUL in text and
    /// JSONB strings, so every ledger checks this before any I/O.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("version", &self.version),
            ("description", &self.description),
            ("hash", &self.hash),
            ("operator_version", &self.operator_version),
        ];
        for (field, value) in fields {
            if value.contains('\0') {
                return Err(self.invalid(field));
            }
        }
        if self
            .meta
            .iter()
            .any(|(key, value)| key.contains('\0') || json_has_nul(value))
        {
            return Err(self.invalid("meta"));
        }
        Ok(())
    }

    fn invalid(&self, field: &str) -> TallyError {
        TallyError::InvalidArgument(format!(
            "revision '{}': {} must not contain NUL characters",
            self.version.escape_default(),
            field
        ))
    }
}

fn json_has_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(json_has_nul),
        Value::Object(map) => map
            .iter()
            .any(|(key, value)| key.contains('\0') || json_has_nul(value)),
        _ => false,
    }
}

/// Resolve the configured schema name for a ledger.
///
/// An empty name falls back to [`DEFAULT_REVISIONS_SCHEMA`].
pub fn resolve_namespace(name: &str) -> Result<String> {
    if name.is_empty() {
        return Ok(DEFAULT_REVISIONS_SCHEMA.to_string());
    }
    if name.contains('\0') {
        return Err(TallyError::InvalidArgument(
            "revision schema name must not contain NUL bytes".into(),
        ));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(TallyError::InvalidArgument(format!(
            "revision schema name '{}' exceeds {} bytes",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    Ok(name.to_string())
}
