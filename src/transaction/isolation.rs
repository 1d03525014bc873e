//! Transaction isolation levels.
//!
//! Four SQL levels are accepted, ordered from weakest to strictest:
//! - ReadUncommitted: accepted for compatibility, runs as ReadCommitted
//! - ReadCommitted: every read sees the latest committed state
//! - RepeatableRead: every read sees the snapshot taken at `begin`
//! - Serializable: snapshot reads, and serializable units of work run one at a time

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction isolation level.
///
/// The derived ordering follows strictness, so `a < b` means `b` gives
/// stronger guarantees than `a`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read Uncommitted isolation.
    ///
    /// The store never exposes uncommitted data, so this behaves exactly
    /// like `ReadCommitted`.
    ReadUncommitted,

    /// Read Committed isolation.
    ///
    /// Each read sees the most recently committed data at the time of the read.
    /// Two reads of the same row may disagree if another transaction commits
    /// in between.
    #[default]
    ReadCommitted,

    /// Repeatable Read isolation (Snapshot Isolation).
    ///
    /// All reads see a consistent snapshot as of the transaction's start.
    /// Writing a row that someone else committed after the snapshot fails
    /// with a serialization conflict (first updater wins).
    RepeatableRead,

    /// Serializable isolation.
    ///
    /// Snapshot reads plus exclusive admission: at most one serializable
    /// transaction is open against a store at any time, so a validation
    /// read and the dependent write cannot interleave with another
    /// serializable unit of work.
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Check if this isolation level reads from a snapshot taken at `begin`.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Check if transactions at this level are admitted one at a time.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }

    /// Check if a transaction at this level satisfies a request for `requested`.
    pub fn satisfies(&self, requested: IsolationLevel) -> bool {
        *self >= requested
    }

    /// Get a human-readable description of this isolation level.
    pub fn description(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => {
                "Treated as read committed; uncommitted data is never visible"
            }
            IsolationLevel::ReadCommitted => "Each read sees the latest committed data",
            IsolationLevel::RepeatableRead => {
                "All reads see a consistent snapshot from transaction start"
            }
            IsolationLevel::Serializable => {
                "Snapshot reads; serializable transactions never overlap"
            }
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "READ UNCOMMITTED" | "READ_UNCOMMITTED" | "READUNCOMMITTED" => {
                Ok(IsolationLevel::ReadUncommitted)
            }
            "READ COMMITTED" | "READ_COMMITTED" | "READCOMMITTED" => {
                Ok(IsolationLevel::ReadCommitted)
            }
            "REPEATABLE READ" | "REPEATABLE_READ" | "REPEATABLEREAD" | "SNAPSHOT" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
