use std::fmt;

use thiserror::Error;

/// Ledger operation an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    Read,
    Write,
    /// Running a migration's statements against the target database.
    Migrate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Migrate => "migrate",
        };
        f.write_str(name)
    }
}

/// Broad class of a storage failure, used by callers to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Network blips, pool exhaustion, serialization failures. Safe to retry.
    Transient,
    /// Missing schema/table, permission problems, incompatible objects.
    Structural,
    /// A constraint rejected the statement.
    Constraint,
    /// A stored row could not be mapped back into a revision.
    Corrupt,
}

impl StorageErrorKind {
    /// Classify a sqlx error.
    pub fn from_sqlx(err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageErrorKind::Transient,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StorageErrorKind::Corrupt,
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => Self::from_sqlstate(&code),
                None => StorageErrorKind::Structural,
            },
            _ => StorageErrorKind::Structural,
        }
    }

    /// Classify a Postgres SQLSTATE code.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            // serialization_failure, deadlock_detected
            "40001" | "40P01" => StorageErrorKind::Transient,
            // connection exceptions, insufficient resources, operator intervention
            c if c.starts_with("08") || c.starts_with("53") || c.starts_with("57") => {
                StorageErrorKind::Transient
            }
            c if c.starts_with("23") => StorageErrorKind::Constraint,
            _ => StorageErrorKind::Structural,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageErrorKind::Transient => "transient",
            StorageErrorKind::Structural => "structural",
            StorageErrorKind::Constraint => "constraint",
            StorageErrorKind::Corrupt => "corrupt",
        };
        f.write_str(name)
    }
}

/// Core error type for tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error for schema '{namespace}': {message}")]
    Connection { namespace: String, message: String },

    #[error(
        "Storage error ({kind}) during {operation} on schema '{namespace}'{}: {message}",
        version_suffix(.version)
    )]
    Storage {
        operation: Operation,
        namespace: String,
        version: Option<String>,
        kind: StorageErrorKind,
        message: String,
    },

    #[error("Cancelled: {operation} on schema '{namespace}'")]
    Cancelled {
        operation: Operation,
        namespace: String,
    },

    #[error("Timeout: {operation} on schema '{namespace}' exceeded its deadline")]
    Timeout {
        operation: Operation,
        namespace: String,
    },

    #[error("Migration {version} failed: {message}")]
    Migration { version: String, message: String },

    #[error("Migration {version} was modified after it was applied (recorded hash {recorded}, current hash {current})")]
    Drift {
        version: String,
        recorded: String,
        current: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn version_suffix(version: &Option<String>) -> String {
    match version {
        Some(v) => format!(" for version '{}'", v),
        None => String::new(),
    }
}

impl TallyError {
    /// Wrap a sqlx error raised by a ledger operation.
    pub fn storage(operation: Operation, namespace: &str, err: sqlx::Error) -> Self {
        TallyError::Storage {
            operation,
            namespace: namespace.to_string(),
            version: None,
            kind: StorageErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }

    /// Attach the version at fault to a storage error. Other variants are returned unchanged.
    pub fn with_version(self, v: impl Into<String>) -> Self {
        match self {
            TallyError::Storage {
                operation,
                namespace,
                kind,
                message,
                ..
            } => TallyError::Storage {
                operation,
                namespace,
                version: Some(v.into()),
                kind,
                message,
            },
            other => other,
        }
    }

    /// Whether the caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            TallyError::Storage { kind, .. } => *kind == StorageErrorKind::Transient,
            TallyError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TallyError::Cancelled { .. })
    }

    /// Storage error kind, if this is a storage error.
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            TallyError::Storage { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type alias using TallyError.
pub type Result<T> = std::result::Result<T, TallyError>;
