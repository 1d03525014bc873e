//! Storage layer error types
//!
//! Every failure the store can report is a structured variant. Concurrency
//! failures carry a [`ConflictKind`] so upper layers can classify them with
//! a match instead of inspecting messages.

use std::fmt;

use thiserror::Error;

use crate::storage::types::{InvalidNameError, RowKey, TableName};

/// the kind of concurrency conflict reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// waiting for the lock would close a cycle in the waits-for graph
    Deadlock,
    /// the row changed after this transaction's snapshot was taken
    Serialization,
    /// a row lock or the serializable gate was not granted in time
    LockTimeout,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Deadlock => write!(f, "deadlock"),
            ConflictKind::Serialization => write!(f, "serialization"),
            ConflictKind::LockTimeout => write!(f, "lock wait timeout"),
        }
    }
}

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// the requested row was not found
    #[error("row not found: table={table}, key={key}")]
    RowNotFound { table: TableName, key: RowKey },

    /// the requested table was not found
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    /// the row already exists (duplicate primary key)
    #[error("row already exists: table={table}, key={key}")]
    RowAlreadyExists { table: TableName, key: RowKey },

    /// the table already exists
    #[error("table already exists: {0}")]
    TableAlreadyExists(TableName),

    /// invalid table or key name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// the row data doesn't have the expected shape
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// concurrent transactions could not both proceed
    #[error("{kind} conflict: {detail}")]
    Conflict { kind: ConflictKind, detail: String },

    /// the store has been closed
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// no connection became available in time
    #[error("connection pool exhausted: {in_use} of {max} connections in use")]
    PoolExhausted { in_use: usize, max: usize },

    /// an operation needed an open transaction
    #[error("no active transaction on connection {0}")]
    NoActiveTransaction(u64),

    /// `begin` was called while a transaction was already open
    #[error("transaction already active on connection {0}")]
    TransactionAlreadyActive(u64),

    /// savepoint name not known to the current transaction
    #[error("unknown savepoint: {0}")]
    UnknownSavepoint(String),

    /// raw statement the store does not understand
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
}

impl StorageError {
    pub(crate) fn conflict(kind: ConflictKind, detail: impl Into<String>) -> Self {
        StorageError::Conflict {
            kind,
            detail: detail.into(),
        }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RowNotFound { .. } | StorageError::TableNotFound(_)
        )
    }

    /// the conflict kind, if this is a concurrency conflict
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StorageError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// check if the store itself is unreachable
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionClosed(_) | StorageError::PoolExhausted { .. }
        )
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
