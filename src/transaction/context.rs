//! Transaction context: the handle a step works through.
//!
//! A context owns one connection for the duration of one unit of work.
//! Finishing it (commit or rollback) consumes it, so a context can never be
//! used after its connection is released. If a context is dropped without
//! being finished, e.g. while a step panics, the transaction is rolled back
//! and the connection released by `Drop`.
//!
//! Steps see only the row-level half of the connection ([`RowAccess`]);
//! begin, commit, rollback and savepoint statements stay in this crate.

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use ulid::Ulid;

use crate::storage::{Connection, RowAccess};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;

/// Transaction metadata.
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    /// Unique transaction ID.
    pub tx_id: String,
    /// Identifier of the connection the transaction runs on.
    pub connection_id: u64,
    /// Isolation level for this transaction.
    pub isolation: IsolationLevel,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
}

/// An open transaction bound to exactly one connection.
pub struct TransactionContext<C: Connection> {
    metadata: TransactionMetadata,
    conn: C,
    /// last savepoint number handed out
    savepoint_seq: u64,
    /// savepoints currently open
    savepoint_depth: usize,
    /// a savepoint could not be rolled back; commit is refused
    rollback_only: bool,
    finished: bool,
}

impl<C: Connection> TransactionContext<C> {
    /// Begin a transaction on `conn`. If `begin` fails the connection is
    /// dropped, which releases it.
    pub(crate) fn begin(mut conn: C, isolation: IsolationLevel) -> TransactionResult<Self> {
        conn.begin(isolation)?;
        Ok(Self {
            metadata: TransactionMetadata {
                tx_id: Ulid::new().to_string().to_lowercase(),
                connection_id: conn.id(),
                isolation,
                started_at: Utc::now(),
            },
            conn,
            savepoint_seq: 0,
            savepoint_depth: 0,
            rollback_only: false,
            finished: false,
        })
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.metadata.tx_id
    }

    /// Get the isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.metadata.isolation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.metadata.started_at
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    /// Number of savepoints currently open on this transaction.
    pub fn savepoint_depth(&self) -> usize {
        self.savepoint_depth
    }

    /// Check if code running now is inside a nested unit of work.
    pub fn is_nested(&self) -> bool {
        self.savepoint_depth > 0
    }

    /// Check whether this transaction can only be rolled back.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Row reads for the open transaction.
    pub fn rows(&self) -> &dyn RowAccess {
        &self.conn
    }

    /// Row reads and writes for the open transaction.
    ///
    /// Transaction control is not reachable from here:
    ///
    /// ```compile_fail
    /// use txcontrol::{MemoryStore, TransactionController};
    ///
    /// let controller = TransactionController::new(MemoryStore::default());
    /// let _ = controller.execute(None, |ctx| {
    ///     ctx.rows_mut().commit()?;
    ///     Ok(())
    /// });
    /// ```
    pub fn rows_mut(&mut self) -> &mut dyn RowAccess {
        &mut self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub(crate) fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Next savepoint name; unique within this transaction.
    pub(crate) fn next_savepoint_name(&mut self) -> String {
        self.savepoint_seq += 1;
        format!("sp_{}", self.savepoint_seq)
    }

    pub(crate) fn enter_savepoint(&mut self) {
        self.savepoint_depth += 1;
    }

    pub(crate) fn leave_savepoint(&mut self) {
        self.savepoint_depth = self.savepoint_depth.saturating_sub(1);
    }

    /// Commit and release the connection.
    pub(crate) fn commit(mut self) -> TransactionResult<()> {
        self.finished = true;
        let refusal = if self.savepoint_depth != 0 {
            Some(format!(
                "commit with {} savepoint(s) still open",
                self.savepoint_depth
            ))
        } else if self.rollback_only {
            Some("commit of a transaction whose savepoint could not be undone".to_string())
        } else {
            None
        };

        if let Some(reason) = refusal {
            if let Err(e) = self.conn.rollback() {
                error!(tx_id = %self.metadata.tx_id, error = %e, "rollback after refused commit failed");
            }
            return Err(TransactionError::InvalidOperation(reason));
        }
        self.conn.commit().map_err(TransactionError::from)
    }

    /// Roll back and release the connection.
    pub(crate) fn rollback(mut self) -> TransactionResult<()> {
        self.finished = true;
        self.conn.rollback().map_err(TransactionError::from)
    }
}

impl<C: Connection> Drop for TransactionContext<C> {
    fn drop(&mut self) {
        if self.finished || !self.conn.in_transaction() {
            return;
        }
        warn!(
            tx_id = %self.metadata.tx_id,
            conn = self.metadata.connection_id,
            "transaction context dropped while open, rolling back"
        );
        if let Err(e) = self.conn.rollback() {
            error!(tx_id = %self.metadata.tx_id, error = %e, "rollback of abandoned transaction failed");
        }
    }
}

impl<C: Connection> std::fmt::Debug for TransactionContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("tx_id", &self.metadata.tx_id)
            .field("connection_id", &self.metadata.connection_id)
            .field("isolation", &self.metadata.isolation)
            .field("savepoint_depth", &self.savepoint_depth)
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}
