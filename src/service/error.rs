//! Service error types.

use thiserror::Error;

use crate::transaction::{ErrorClass, TransactionError};

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Service failures, grouped by how a caller should respond.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {table}/{key}")]
    NotFound { table: String, key: String },

    #[error("invalid request: {0}")]
    Invalid(String),

    /// Conflict or connection trouble; the same request may succeed later.
    #[error("temporarily unavailable: {0}")]
    RetryLater(#[source] TransactionError),

    #[error("internal error: {0}")]
    Internal(#[source] TransactionError),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Check if the caller should be told to retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::RetryLater(_))
    }
}

impl From<TransactionError> for ServiceError {
    fn from(err: TransactionError) -> Self {
        match err.class() {
            ErrorClass::Validation => match err.primary() {
                TransactionError::NotFound { table, key } => Self::NotFound {
                    table: table.clone(),
                    key: key.clone(),
                },
                TransactionError::Validation(message) => Self::Invalid(message.clone()),
                other => Self::Invalid(other.to_string()),
            },
            ErrorClass::Conflict | ErrorClass::Connection => Self::RetryLater(err),
            ErrorClass::Internal => Self::Internal(err),
        }
    }
}
