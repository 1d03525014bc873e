//! storage layer for txcontrol
//!
//! The transaction layer only ever talks to the store through the
//! [`Connection`] and [`ConnectionSource`] traits; steps only reach the
//! row-level half, [`RowAccess`]. [`MemoryStore`] is the in-process
//! implementation used by the repository, service layer and tests.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ConnectionSource / Connection                  │
//! │   (begin, commit, rollback, savepoint statements, rows)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MemoryStore                           │
//! │    (version chains, connection pool, snapshot registry)     │
//! └─────────────────────────────────────────────────────────────┘
//!        │                                           │
//!        ▼                                           ▼
//!  ┌─────────────┐                            ┌─────────────┐
//!  │  LockTable  │                            │ SerialGate  │
//!  │ (row locks) │                            │(serializable│
//!  └─────────────┘                            │  admission) │
//!                                             └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use serde_json::json;
//! use txcontrol::storage::{Connection, MemoryStore, Row, RowAccess, RowKey, TableName};
//! use txcontrol::IsolationLevel;
//!
//! let store = MemoryStore::default();
//! let users = TableName::new("users").unwrap();
//! store.create_table(&users).unwrap();
//!
//! let mut conn = store.acquire().unwrap();
//! conn.begin(IsolationLevel::ReadCommitted).unwrap();
//! let row = Row::from_value(RowKey::generate(), json!({"name": "Alice"})).unwrap();
//! conn.insert_row(&users, row).unwrap();
//! conn.commit().unwrap();
//!
//! assert_eq!(store.committed_rows(&users).unwrap().len(), 1);
//! ```

mod connection;
mod errors;
mod locks;
mod memory;
mod types;

pub use connection::{Connection, ConnectionSource, RowAccess, SavepointStatement};
pub use errors::{ConflictKind, StorageError, StorageResult};
pub use memory::{MemoryConnection, MemoryStore, PoolStats};
pub use types::{InvalidNameError, Row, RowKey, TableName};
