//! Row representation of a revision and the explicit mapping to and from it.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use thiserror::Error;

use super::{ExecutionState, Revision, TIMESTAMP_PRECISION};

/// A revision as stored in the ledger table.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionRecord {
    pub version: String,
    pub description: String,
    pub execution_state: String,
    pub executed_at: DateTime<Utc>,
    /// Nanoseconds.
    pub execution_time: i64,
    pub hash: String,
    pub operator_version: String,
    pub meta: serde_json::Value,
}

/// A stored row that cannot be turned back into a revision.
#[derive(Error, Debug, PartialEq)]
pub enum RecordError {
    #[error("{0}")]
    UnknownState(String),

    #[error("negative execution time {0}ns")]
    NegativeExecutionTime(i64),

    #[error("meta is not a JSON object")]
    MetaNotObject,
}

impl<'r> FromRow<'r, PgRow> for RevisionRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            execution_state: row.try_get("execution_state")?,
            executed_at: row.try_get("executed_at")?,
            execution_time: row.try_get("execution_time")?,
            hash: row.try_get("hash")?,
            operator_version: row.try_get("operator_version")?,
            meta: row.try_get("meta")?,
        })
    }
}

pub fn to_record(rev: &Revision) -> RevisionRecord {
    RevisionRecord {
        version: rev.version.clone(),
        description: rev.description.clone(),
        execution_state: rev.execution_state.as_str().to_string(),
        executed_at: rev.executed_at.trunc_subsecs(TIMESTAMP_PRECISION),
        // Saturates after ~292 years.
        execution_time: i64::try_from(rev.execution_time.as_nanos()).unwrap_or(i64::MAX),
        hash: rev.hash.clone(),
        operator_version: rev.operator_version.clone(),
        meta: serde_json::Value::Object(rev.meta.clone()),
    }
}

pub fn from_record(rec: RevisionRecord) -> Result<Revision, RecordError> {
    let execution_state = rec
        .execution_state
        .parse::<ExecutionState>()
        .map_err(RecordError::UnknownState)?;

    let nanos = u64::try_from(rec.execution_time)
        .map_err(|_| RecordError::NegativeExecutionTime(rec.execution_time))?;

    let meta = match rec.meta {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        _ => return Err(RecordError::MetaNotObject),
    };

    Ok(Revision {
        version: rec.version,
        description: rec.description,
        execution_state,
        executed_at: rec.executed_at,
        execution_time: Duration::from_nanos(nanos),
        hash: rec.hash,
        operator_version: rec.operator_version,
        meta,
    })
}
