//! txcontrol - transaction orchestration for relational stores
//!
//! Every multi-step database operation runs as one atomic,
//! isolation-controlled unit of work: dependent steps share a connection and
//! a transaction, nested calls get savepoints, and conflicts (deadlock,
//! serialization failure, lock wait timeout) are retried with exponential
//! backoff.
//!
//! # Example
//!
//! ```
//! use txcontrol::service::{install_tables, TodoService, UserService};
//! use txcontrol::{MemoryStore, TransactionController};
//!
//! let store = MemoryStore::default();
//! install_tables(&store).unwrap();
//!
//! let controller = TransactionController::new(store);
//! let users = UserService::new(controller.clone()).unwrap();
//! let todos = TodoService::new(controller).unwrap();
//!
//! let alice = users.register("alice@example.com", "Alice").unwrap();
//! let todo = todos.create(&alice.key, "write the report").unwrap();
//! todos.complete(&alice.key, &todo.key).unwrap();
//!
//! // the email check and the insert run as one serializable unit of work
//! assert!(users.register("alice@example.com", "Impostor").is_err());
//! ```

pub mod config;
pub mod repository;
pub mod service;
pub mod storage;
pub mod transaction;

pub use config::{ConfigError, ControllerConfig, StoreConfig};
pub use storage::{ConflictKind, Connection, ConnectionSource, MemoryStore, StorageError};
pub use transaction::{
    step, IsolationLevel, Step, TransactionContext, TransactionController, TransactionError,
    TransactionResult,
};
