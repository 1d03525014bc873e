//! Row write locks and the serializable admission gate.
//!
//! Row locks are held from the first write until the owning transaction
//! commits or rolls back. A requester that finds a row locked records a
//! waits-for edge; if following edges from the holder leads back to the
//! requester, the request fails immediately with a deadlock conflict.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::storage::errors::{ConflictKind, StorageError, StorageResult};
use crate::storage::types::{RowKey, TableName};

pub(crate) type LockKey = (TableName, RowKey);

#[derive(Default)]
struct LockState {
    /// row -> owning connection
    owners: HashMap<LockKey, u64>,
    /// waiting connection -> connection it waits for
    waits_for: HashMap<u64, u64>,
}

impl LockState {
    /// Follow waits-for edges starting at `holder`; a path back to
    /// `requester` means granting the wait would deadlock.
    fn closes_cycle(&self, requester: u64, holder: u64) -> bool {
        let mut current = holder;
        for _ in 0..=self.waits_for.len() {
            match self.waits_for.get(&current) {
                Some(&next) if next == requester => return true,
                Some(&next) => current = next,
                None => return false,
            }
        }
        false
    }
}

/// Exclusive row locks with deadlock detection.
#[derive(Default)]
pub(crate) struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockTable {
    /// Acquire the write lock on `key` for `conn`, waiting up to `timeout`.
    pub(crate) fn acquire(&self, conn: u64, key: &LockKey, timeout: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let holder = match state.owners.get(key).copied() {
                None => {
                    state.owners.insert(key.clone(), conn);
                    state.waits_for.remove(&conn);
                    return Ok(());
                }
                Some(holder) if holder == conn => {
                    state.waits_for.remove(&conn);
                    return Ok(());
                }
                Some(holder) => holder,
            };

            if state.closes_cycle(conn, holder) {
                state.waits_for.remove(&conn);
                return Err(StorageError::conflict(
                    ConflictKind::Deadlock,
                    format!(
                        "connection {} waiting on {}/{} held by connection {}",
                        conn, key.0, key.1, holder
                    ),
                ));
            }

            state.waits_for.insert(conn, holder);
            let timed_out = self.released.wait_until(&mut state, deadline).timed_out();

            let still_held = state.owners.get(key).is_some_and(|&owner| owner != conn);
            if timed_out && still_held {
                state.waits_for.remove(&conn);
                return Err(StorageError::conflict(
                    ConflictKind::LockTimeout,
                    format!(
                        "row {}/{} still locked after {:?}",
                        key.0, key.1, timeout
                    ),
                ));
            }
        }
    }

    /// Release every lock owned by `conn` and wake all waiters.
    pub(crate) fn release_all(&self, conn: u64) {
        let mut state = self.state.lock();
        state.owners.retain(|_, owner| *owner != conn);
        state.waits_for.remove(&conn);
        drop(state);
        self.released.notify_all();
    }

    pub(crate) fn held_by(&self, conn: u64) -> usize {
        self.state.lock().owners.values().filter(|&&owner| owner == conn).count()
    }
}

/// Admission gate for serializable transactions: one holder at a time.
#[derive(Default)]
pub(crate) struct SerialGate {
    holder: Mutex<Option<u64>>,
    freed: Condvar,
}

impl SerialGate {
    pub(crate) fn acquire(&self, conn: u64, timeout: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let mut holder = self.holder.lock();

        loop {
            match *holder {
                None => {
                    *holder = Some(conn);
                    return Ok(());
                }
                Some(current) if current == conn => return Ok(()),
                Some(current) => {
                    if self.freed.wait_until(&mut holder, deadline).timed_out()
                        && holder.is_some_and(|h| h != conn)
                    {
                        return Err(StorageError::conflict(
                            ConflictKind::LockTimeout,
                            format!(
                                "serializable admission held by connection {} for over {:?}",
                                current, timeout
                            ),
                        ));
                    }
                }
            }
        }
    }

    pub(crate) fn release(&self, conn: u64) {
        let mut holder = self.holder.lock();
        if *holder == Some(conn) {
            *holder = None;
            drop(holder);
            self.freed.notify_all();
        }
    }
}
