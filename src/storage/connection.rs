//! The connection interface the transaction layer drives.
//!
//! A [`ConnectionSource`] hands out connections; dropping a connection
//! releases it back to its source. A connection runs at most one
//! transaction at a time and understands three raw statements:
//!
//! ```text
//! SAVEPOINT <name>
//! RELEASE SAVEPOINT <name>
//! ROLLBACK TO SAVEPOINT <name>
//! ```

use crate::storage::errors::StorageResult;
use crate::storage::types::{Row, RowKey, TableName};
use crate::transaction::IsolationLevel;

/// Row-level reads and writes inside an open transaction.
///
/// This is all a step gets to see of its connection; transaction control
/// stays with the transaction layer.
pub trait RowAccess {
    /// Read one row as visible to the open transaction.
    fn read_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Option<Row>>;

    /// Read every row of a table as visible to the open transaction, in key order.
    fn scan_table(&self, table: &TableName) -> StorageResult<Vec<Row>>;

    /// Insert a new row; fails if the key already exists.
    fn insert_row(&mut self, table: &TableName, row: Row) -> StorageResult<Row>;

    /// Replace an existing row; the store bumps its version and `updated_at`.
    fn update_row(&mut self, table: &TableName, row: Row) -> StorageResult<Row>;
}

/// A live connection to a relational store.
pub trait Connection: RowAccess + Send {
    /// Identifier, unique within the owning source.
    fn id(&self) -> u64;

    /// Check whether a transaction is open on this connection.
    fn in_transaction(&self) -> bool;

    /// Begin a transaction at the given isolation level.
    fn begin(&mut self, isolation: IsolationLevel) -> StorageResult<()>;

    /// Commit the open transaction. On failure the transaction is gone.
    fn commit(&mut self) -> StorageResult<()>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> StorageResult<()>;

    /// Run a raw statement (savepoint control).
    fn execute_raw(&mut self, statement: &str) -> StorageResult<()>;
}

/// Something that can hand out connections.
pub trait ConnectionSource: Send + Sync {
    type Conn: Connection;

    /// Acquire a connection. Dropping it releases it.
    fn acquire(&self) -> StorageResult<Self::Conn>;
}

/// Parsed form of the raw statements a connection accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavepointStatement {
    Create(String),
    Release(String),
    RollbackTo(String),
}

impl SavepointStatement {
    /// Parse `SAVEPOINT x`, `RELEASE [SAVEPOINT] x` or `ROLLBACK TO [SAVEPOINT] x`.
    pub fn parse(statement: &str) -> Option<Self> {
        let words: Vec<String> = statement
            .trim()
            .trim_end_matches(';')
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        let stmt = match upper.as_slice() {
            ["SAVEPOINT", _] => Self::Create(words[1].clone()),
            ["RELEASE", "SAVEPOINT", _] => Self::Release(words[2].clone()),
            ["RELEASE", _] => Self::Release(words[1].clone()),
            ["ROLLBACK", "TO", "SAVEPOINT", _] => Self::RollbackTo(words[3].clone()),
            ["ROLLBACK", "TO", _] => Self::RollbackTo(words[2].clone()),
            _ => return None,
        };

        let name = stmt.name();
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.eq_ignore_ascii_case("savepoint");
        valid.then_some(stmt)
    }

    /// The savepoint name the statement refers to.
    pub fn name(&self) -> &str {
        match self {
            Self::Create(name) | Self::Release(name) | Self::RollbackTo(name) => name,
        }
    }

    /// Render back to SQL.
    pub fn to_sql(&self) -> String {
        match self {
            Self::Create(name) => format!("SAVEPOINT {}", name),
            Self::Release(name) => format!("RELEASE SAVEPOINT {}", name),
            Self::RollbackTo(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
        }
    }
}
