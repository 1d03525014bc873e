//! Transaction orchestration.
//!
//! A unit of work is a closure (or an ordered list of closures) that runs
//! against one [`TransactionContext`]. The [`TransactionController`] owns
//! the lifecycle around it: acquire a connection, begin at the requested
//! isolation level, run the work, commit or roll back, release.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionController                      │
//! │   (execute, execute_dependent, nesting, retry, config)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │  Savepoint  │       │   Retry     │
//!  │  Context    │       │  Manager    │       │   Policy    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! Nesting is explicit: code that wants to join an open transaction takes
//! the parent's `&mut TransactionContext` and calls
//! [`TransactionController::execute_within`] (or `execute_reusing`), which
//! brackets the nested work with a savepoint.
//!
//! # Usage
//!
//! ```
//! use serde_json::json;
//! use txcontrol::storage::{MemoryStore, Row, RowKey, TableName};
//! use txcontrol::transaction::{IsolationLevel, TransactionController, TransactionError};
//!
//! let store = MemoryStore::default();
//! let accounts = TableName::new("accounts").unwrap();
//! store.create_table(&accounts).unwrap();
//!
//! let controller = TransactionController::new(store.clone());
//! let row = controller
//!     .execute(Some(IsolationLevel::Serializable), |ctx| {
//!         let row = Row::from_value(RowKey::generate(), json!({"balance": 10})).unwrap();
//!         Ok(ctx.rows_mut().insert_row(&accounts, row)?)
//!     })
//!     .unwrap();
//!
//! let failed: Result<(), _> = controller.execute(None, |ctx| {
//!     ctx.rows_mut().insert_row(&accounts, row.clone())?;
//!     Err(TransactionError::validation("never mind"))
//! });
//! assert!(failed.is_err());
//! assert_eq!(store.committed_rows(&accounts).unwrap().len(), 1);
//! ```

mod context;
mod controller;
mod error;
mod isolation;
mod retry;
mod savepoint;

pub use context::{TransactionContext, TransactionMetadata};
pub use controller::{step, Step, TransactionController};
pub use error::{ErrorClass, TransactionError, TransactionResult};
pub use isolation::IsolationLevel;
pub use retry::{RetryPolicy, RetryState};
pub use savepoint::SavepointManager;
