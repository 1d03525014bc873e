//! Transaction error types.

use thiserror::Error;

use crate::storage::{ConflictKind, StorageError};

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur while running a unit of work.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A step's precondition did not hold.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced record does not exist (or is soft-deleted).
    #[error("record not found: {table}/{key}")]
    NotFound { table: String, key: String },

    /// The store reported a deadlock, serialization conflict or lock timeout.
    #[error("{kind} conflict: {detail}")]
    Conflict { kind: ConflictKind, detail: String },

    /// The store could not be reached.
    #[error("connection failure: {0}")]
    Connection(String),

    /// A step of a dependent unit of work failed; `index` is 1-based.
    #[error("step {index} failed: {source}")]
    Step {
        index: usize,
        #[source]
        source: Box<TransactionError>,
    },

    /// The unit of work failed and undoing it failed too.
    #[error("{source} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        source: Box<TransactionError>,
        rollback: Box<TransactionError>,
    },

    /// Any other store error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// The controller was used in a way it does not support.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Coarse classification, used to pick a response at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// "not found / invalid"
    Validation,
    /// transient, worth retrying
    Conflict,
    /// transient, infrastructure problem
    Connection,
    Internal,
}

impl ErrorClass {
    /// Check if the caller should be told to retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Conflict | ErrorClass::Connection)
    }
}

impl TransactionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(table: impl ToString, key: impl ToString) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    /// Wrap a failure with the 1-based index of the step that raised it.
    pub fn step(index: usize, source: TransactionError) -> Self {
        Self::Step {
            index,
            source: Box::new(source),
        }
    }

    /// Attach a rollback failure to the failure that caused the rollback.
    pub fn with_rollback_failure(self, rollback: TransactionError) -> Self {
        Self::RollbackFailed {
            source: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// The failure underneath any step or rollback wrappers.
    pub fn primary(&self) -> &TransactionError {
        match self {
            Self::Step { source, .. } | Self::RollbackFailed { source, .. } => source.primary(),
            other => other,
        }
    }

    /// 1-based index of the failing step, if this came from a dependent unit of work.
    pub fn failed_step(&self) -> Option<usize> {
        match self {
            Self::Step { index, .. } => Some(*index),
            Self::RollbackFailed { source, .. } => source.failed_step(),
            _ => None,
        }
    }

    /// The secondary rollback failure, if one was attached.
    pub fn rollback_failure(&self) -> Option<&TransactionError> {
        match self {
            Self::RollbackFailed { rollback, .. } => Some(rollback.as_ref()),
            Self::Step { source, .. } => source.rollback_failure(),
            _ => None,
        }
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self.primary() {
            Self::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.primary() {
            Self::Validation(_) | Self::NotFound { .. } => ErrorClass::Validation,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Connection(_) => ErrorClass::Connection,
            _ => ErrorClass::Internal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}

impl From<StorageError> for TransactionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RowNotFound { table, key } => Self::not_found(table, key),
            StorageError::Conflict { kind, detail } => Self::Conflict { kind, detail },
            err if err.is_connection_failure() => Self::Connection(err.to_string()),
            err => Self::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RowKey, TableName};

    #[test]
    fn test_error_retryable() {
        let conflict: TransactionError =
            StorageError::conflict(ConflictKind::Deadlock, "cycle").into();
        assert!(conflict.is_retryable());
        assert_eq!(conflict.conflict_kind(), Some(ConflictKind::Deadlock));

        let validation = TransactionError::validation("email taken");
        assert!(!validation.is_retryable());
        assert_eq!(validation.class(), ErrorClass::Validation);
    }

    #[test]
    fn test_storage_error_mapping() {
        let not_found: TransactionError = StorageError::RowNotFound {
            table: TableName::new("users").unwrap(),
            key: RowKey::new("u1").unwrap(),
        }
        .into();
        assert!(matches!(
            &not_found,
            TransactionError::NotFound { table, key } if table == "users" && key == "u1"
        ));

        let closed: TransactionError = StorageError::ConnectionClosed("gone".into()).into();
        assert_eq!(closed.class(), ErrorClass::Connection);
        assert!(closed.class().is_transient());

        let other: TransactionError =
            StorageError::InvalidStatement("VACUUM".into()).into();
        assert!(matches!(other, TransactionError::Storage(_)));
        assert_eq!(other.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_wrappers_are_transparent() {
        let conflict = TransactionError::Conflict {
            kind: ConflictKind::Serialization,
            detail: "row changed".into(),
        };
        let wrapped = TransactionError::step(2, conflict)
            .with_rollback_failure(TransactionError::Connection("lost".into()));

        assert!(wrapped.is_retryable());
        assert_eq!(wrapped.failed_step(), Some(2));
        assert!(matches!(
            wrapped.rollback_failure(),
            Some(TransactionError::Connection(_))
        ));
        assert!(matches!(wrapped.primary(), TransactionError::Conflict { .. }));
        assert_eq!(
            wrapped.to_string(),
            "step 2 failed: serialization conflict: row changed (rollback also failed: connection failure: lost)"
        );
    }
}
