//! Savepoints for nested units of work.
//!
//! A nested unit of work runs on its parent's connection, bracketed by a
//! savepoint. On success the savepoint is released and the work becomes part
//! of the parent transaction; on failure the connection is rolled back to
//! the savepoint and the parent stays open, with everything it did before
//! the nested call intact.

use tracing::{debug, error, warn};

use crate::storage::{Connection, SavepointStatement};
use crate::transaction::context::TransactionContext;
use crate::transaction::error::{TransactionError, TransactionResult};

/// Issues, releases and rolls back savepoints on a transaction context.
#[derive(Debug, Default, Clone, Copy)]
pub struct SavepointManager;

impl SavepointManager {
    pub fn new() -> Self {
        Self
    }

    /// Run `step` inside a fresh savepoint on `ctx`.
    ///
    /// The step's failure is returned as-is. A savepoint that cannot be
    /// released is rolled back instead and the release failure returned.
    /// If undoing the savepoint also fails, that failure is logged and
    /// attached as a secondary cause; when the rollback itself failed the
    /// parent transaction is marked rollback-only.
    pub fn with_savepoint<C, T, F>(
        &self,
        ctx: &mut TransactionContext<C>,
        step: F,
    ) -> TransactionResult<T>
    where
        C: Connection,
        F: FnOnce(&mut TransactionContext<C>) -> TransactionResult<T>,
    {
        let name = ctx.next_savepoint_name();
        ctx.connection_mut()
            .execute_raw(&SavepointStatement::Create(name.clone()).to_sql())?;
        ctx.enter_savepoint();
        debug!(tx_id = %ctx.id(), savepoint = %name, depth = ctx.savepoint_depth(), "savepoint opened");

        let outcome = step(ctx);
        ctx.leave_savepoint();

        let err = match outcome {
            Ok(value) => {
                match ctx
                    .connection_mut()
                    .execute_raw(&SavepointStatement::Release(name.clone()).to_sql())
                {
                    Ok(()) => {
                        debug!(tx_id = %ctx.id(), savepoint = %name, "savepoint released");
                        return Ok(value);
                    }
                    Err(release_err) => {
                        let release_err = TransactionError::from(release_err);
                        warn!(tx_id = %ctx.id(), savepoint = %name, error = %release_err, "savepoint release failed, rolling back to it");
                        release_err
                    }
                }
            }
            Err(err) => {
                warn!(tx_id = %ctx.id(), savepoint = %name, error = %err, "nested unit of work failed, rolling back to savepoint");
                err
            }
        };
        Err(Self::undo(ctx, &name, err))
    }

    /// Roll back to the savepoint, then drop it. Returns `err` with any
    /// undo failure attached.
    fn undo<C: Connection>(
        ctx: &mut TransactionContext<C>,
        name: &str,
        err: TransactionError,
    ) -> TransactionError {
        let rollback_to = SavepointStatement::RollbackTo(name.to_string()).to_sql();
        if let Err(undo_err) = ctx.connection_mut().execute_raw(&rollback_to) {
            let undo_err = TransactionError::from(undo_err);
            error!(tx_id = %ctx.id(), savepoint = %name, error = %undo_err, "rollback to savepoint failed, transaction is rollback-only");
            ctx.mark_rollback_only();
            return err.with_rollback_failure(undo_err);
        }

        // the nested writes are gone; a savepoint left on the stack is harmless
        let release = SavepointStatement::Release(name.to_string()).to_sql();
        if let Err(undo_err) = ctx.connection_mut().execute_raw(&release) {
            let undo_err = TransactionError::from(undo_err);
            warn!(tx_id = %ctx.id(), savepoint = %name, error = %undo_err, "release after rollback to savepoint failed");
            return err.with_rollback_failure(undo_err);
        }
        err
    }
}
