//! In-memory relational store with real transaction semantics.
//!
//! Committed data is kept as a version chain per row, stamped with the
//! store-wide commit number that produced it. A transaction buffers its
//! writes in an ordered log; reads consult the log first and then the
//! committed chains, either at the snapshot taken by `begin`
//! (RepeatableRead, Serializable) or at the latest commit (ReadCommitted,
//! ReadUncommitted). Commit applies the whole log under one write lock, so
//! other transactions see all of it or none of it.
//!
//! Concurrency control:
//! - writers take row locks, held until commit or rollback
//!   (see [`LockTable`](crate::storage::locks));
//! - snapshot transactions writing a row committed after their snapshot
//!   fail with a serialization conflict (first updater wins);
//! - serializable transactions pass through a store-wide admission gate.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::storage::connection::{Connection, ConnectionSource, RowAccess, SavepointStatement};
use crate::storage::errors::{ConflictKind, StorageError, StorageResult};
use crate::storage::locks::{LockTable, SerialGate};
use crate::storage::types::{Row, RowKey, TableName};
use crate::transaction::IsolationLevel;

/// One committed version of a row.
#[derive(Debug, Clone)]
struct Version {
    commit: u64,
    row: Row,
}

type Table = BTreeMap<RowKey, Vec<Version>>;

#[derive(Default)]
struct Committed {
    /// commit number of the most recent commit
    version: u64,
    tables: HashMap<TableName, Table>,
}

impl Committed {
    fn table(&self, name: &TableName) -> StorageResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::TableNotFound(name.clone()))
    }
}

/// Row visible at `snapshot`, or the latest one when there is no snapshot.
fn visible(chain: &[Version], snapshot: Option<u64>) -> Option<&Row> {
    match snapshot {
        None => chain.last(),
        Some(at) => chain.iter().rev().find(|v| v.commit <= at),
    }
    .map(|v| &v.row)
}

/// Drop versions no open snapshot can see any more.
fn prune(chain: &mut Vec<Version>, horizon: Option<u64>) {
    let keep_from = match horizon {
        None => chain.len().saturating_sub(1),
        Some(at) => chain.iter().rposition(|v| v.commit <= at).unwrap_or(0),
    };
    chain.drain(..keep_from);
}

/// Connection pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// connections handed out so far
    pub acquired: u64,
    /// connections given back so far
    pub released: u64,
    /// connections currently checked out
    pub in_use: usize,
}

struct StoreInner {
    config: StoreConfig,
    data: RwLock<Committed>,
    locks: LockTable,
    gate: SerialGate,
    pool: Mutex<PoolStats>,
    pool_freed: Condvar,
    /// connection -> snapshot of its open snapshot transaction
    snapshots: Mutex<HashMap<u64, u64>>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
}

impl StoreInner {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::ConnectionClosed("store is closed".into()));
        }
        Ok(())
    }
}

/// Shared handle to an in-memory store. Cloning is cheap.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                data: RwLock::new(Committed::default()),
                locks: LockTable::default(),
                gate: SerialGate::default(),
                pool: Mutex::new(PoolStats::default()),
                pool_freed: Condvar::new(),
                snapshots: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Create an empty table. Schema changes are not transactional.
    pub fn create_table(&self, table: &TableName) -> StorageResult<()> {
        self.inner.check_open()?;
        let mut data = self.inner.data.write();
        if data.tables.contains_key(table) {
            return Err(StorageError::TableAlreadyExists(table.clone()));
        }
        data.tables.insert(table.clone(), Table::new());
        debug!(table = %table, "table created");
        Ok(())
    }

    pub fn table_exists(&self, table: &TableName) -> bool {
        self.inner.data.read().tables.contains_key(table)
    }

    /// Latest committed version of a row, outside any transaction.
    pub fn committed_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Option<Row>> {
        let data = self.inner.data.read();
        Ok(data
            .table(table)?
            .get(key)
            .and_then(|chain| visible(chain, None))
            .cloned())
    }

    /// Latest committed rows of a table in key order, outside any transaction.
    pub fn committed_rows(&self, table: &TableName) -> StorageResult<Vec<Row>> {
        let data = self.inner.data.read();
        Ok(data
            .table(table)?
            .values()
            .filter_map(|chain| visible(chain, None).cloned())
            .collect())
    }

    /// Number of the most recent commit.
    pub fn commit_version(&self) -> u64 {
        self.inner.data.read().version
    }

    pub fn pool_stats(&self) -> PoolStats {
        *self.inner.pool.lock()
    }

    /// Refuse new connections and fail every further operation on open ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.pool_freed.notify_all();
        debug!("store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check out a connection, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> StorageResult<MemoryConnection> {
        self.inner.check_open()?;

        let max = self.inner.config.max_connections;
        let deadline = Instant::now() + self.inner.config.acquire_timeout_duration();
        let mut pool = self.inner.pool.lock();
        while pool.in_use >= max {
            let timed_out = self.inner.pool_freed.wait_until(&mut pool, deadline).timed_out();
            self.inner.check_open()?;
            if timed_out && pool.in_use >= max {
                return Err(StorageError::PoolExhausted {
                    in_use: pool.in_use,
                    max,
                });
            }
        }
        pool.in_use += 1;
        pool.acquired += 1;
        let in_use = pool.in_use;
        drop(pool);

        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(conn = id, in_use, "connection acquired");
        Ok(MemoryConnection {
            id,
            store: Arc::clone(&self.inner),
            tx: None,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl ConnectionSource for MemoryStore {
    type Conn = MemoryConnection;

    fn acquire(&self) -> StorageResult<MemoryConnection> {
        MemoryStore::acquire(self)
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("commit_version", &self.commit_version())
            .field("pool", &self.pool_stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug)]
struct Write {
    table: TableName,
    row: Row,
}

#[derive(Debug)]
struct TxState {
    isolation: IsolationLevel,
    snapshot: u64,
    writes: Vec<Write>,
    /// savepoint name -> length of the write log when it was created
    savepoints: Vec<(String, usize)>,
}

impl TxState {
    fn read_snapshot(&self) -> Option<u64> {
        self.isolation.uses_snapshot().then_some(self.snapshot)
    }

    fn pending(&self, table: &TableName, key: &RowKey) -> Option<&Row> {
        self.writes
            .iter()
            .rev()
            .find(|w| &w.table == table && &w.row.key == key)
            .map(|w| &w.row)
    }

    fn savepoint(&self, name: &str) -> StorageResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StorageError::UnknownSavepoint(name.to_string()))
    }
}

/// A checked-out connection to a [`MemoryStore`].
///
/// Dropping it rolls back any open transaction and returns it to the pool.
pub struct MemoryConnection {
    id: u64,
    store: Arc<StoreInner>,
    tx: Option<TxState>,
}

impl MemoryConnection {
    /// Row locks currently held by this connection.
    pub fn held_locks(&self) -> usize {
        self.store.locks.held_by(self.id)
    }

    fn tx(&self) -> StorageResult<&TxState> {
        self.tx
            .as_ref()
            .ok_or(StorageError::NoActiveTransaction(self.id))
    }

    /// Drop transaction state and everything it holds in the store.
    fn end_transaction(&mut self) -> Option<TxState> {
        let tx = self.tx.take();
        self.store.locks.release_all(self.id);
        self.store.gate.release(self.id);
        self.store.snapshots.lock().remove(&self.id);
        tx
    }

    /// Common entry for writes: checks, then takes the row lock.
    fn lock_for_write(&mut self, table: &TableName, key: &RowKey) -> StorageResult<()> {
        self.store.check_open()?;
        self.tx()?;
        self.store.data.read().table(table)?;
        self.store.locks.acquire(
            self.id,
            &(table.clone(), key.clone()),
            self.store.config.lock_timeout_duration(),
        )
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn begin(&mut self, isolation: IsolationLevel) -> StorageResult<()> {
        self.store.check_open()?;
        if self.tx.is_some() {
            return Err(StorageError::TransactionAlreadyActive(self.id));
        }

        if isolation.is_exclusive() {
            self.store
                .gate
                .acquire(self.id, self.store.config.lock_timeout_duration())?;
        }

        // register the snapshot before any commit can prune what it needs
        let data = self.store.data.read();
        let snapshot = data.version;
        if isolation.uses_snapshot() {
            self.store.snapshots.lock().insert(self.id, snapshot);
        }
        drop(data);

        self.tx = Some(TxState {
            isolation,
            snapshot,
            writes: Vec::new(),
            savepoints: Vec::new(),
        });
        trace!(conn = self.id, %isolation, snapshot, "transaction started");
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        if self.tx.is_none() {
            return Err(StorageError::NoActiveTransaction(self.id));
        }
        if let Err(e) = self.store.check_open() {
            self.end_transaction();
            return Err(e);
        }

        let Some(tx) = self.tx.take() else {
            return Err(StorageError::NoActiveTransaction(self.id));
        };

        // last write per row wins
        let mut latest: BTreeMap<(TableName, RowKey), Row> = BTreeMap::new();
        for write in tx.writes {
            latest.insert((write.table, write.row.key.clone()), write.row);
        }
        let written = latest.len();

        let commit = {
            let mut data = self.store.data.write();
            let commit = data.version + 1;
            let horizon = self.store.snapshots.lock().values().copied().min();
            for ((table, key), row) in latest {
                let chain = data.tables.entry(table).or_default().entry(key).or_default();
                chain.push(Version { commit, row });
                prune(chain, horizon);
            }
            data.version = commit;
            commit
        };

        self.end_transaction();
        trace!(conn = self.id, commit, written, "transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        let Some(tx) = self.end_transaction() else {
            return Err(StorageError::NoActiveTransaction(self.id));
        };
        trace!(conn = self.id, discarded = tx.writes.len(), "transaction rolled back");
        self.store.check_open()
    }

    fn execute_raw(&mut self, statement: &str) -> StorageResult<()> {
        self.store.check_open()?;
        let parsed = SavepointStatement::parse(statement)
            .ok_or_else(|| StorageError::InvalidStatement(statement.to_string()))?;
        let tx = self
            .tx
            .as_mut()
            .ok_or(StorageError::NoActiveTransaction(self.id))?;

        match parsed {
            SavepointStatement::Create(name) => {
                tx.savepoints.push((name, tx.writes.len()));
            }
            SavepointStatement::Release(name) => {
                let pos = tx.savepoint(&name)?;
                tx.savepoints.truncate(pos);
            }
            SavepointStatement::RollbackTo(name) => {
                let pos = tx.savepoint(&name)?;
                let mark = tx.savepoints[pos].1;
                tx.writes.truncate(mark);
                tx.savepoints.truncate(pos + 1);
            }
        }
        trace!(conn = self.id, statement, "savepoint statement applied");
        Ok(())
    }

}

impl RowAccess for MemoryConnection {
    fn read_row(&self, table: &TableName, key: &RowKey) -> StorageResult<Option<Row>> {
        self.store.check_open()?;
        let tx = self.tx()?;
        let data = self.store.data.read();
        let committed = data.table(table)?;

        if let Some(row) = tx.pending(table, key) {
            return Ok(Some(row.clone()));
        }
        Ok(committed
            .get(key)
            .and_then(|chain| visible(chain, tx.read_snapshot()))
            .cloned())
    }

    fn scan_table(&self, table: &TableName) -> StorageResult<Vec<Row>> {
        self.store.check_open()?;
        let tx = self.tx()?;
        let snapshot = tx.read_snapshot();

        let mut rows: BTreeMap<RowKey, Row> = {
            let data = self.store.data.read();
            data.table(table)?
                .iter()
                .filter_map(|(key, chain)| {
                    visible(chain, snapshot).map(|row| (key.clone(), row.clone()))
                })
                .collect()
        };
        for write in tx.writes.iter().filter(|w| &w.table == table) {
            rows.insert(write.row.key.clone(), write.row.clone());
        }
        Ok(rows.into_values().collect())
    }

    fn insert_row(&mut self, table: &TableName, mut row: Row) -> StorageResult<Row> {
        self.lock_for_write(table, &row.key)?;
        let tx = self
            .tx
            .as_mut()
            .ok_or(StorageError::NoActiveTransaction(self.id))?;

        if tx.pending(table, &row.key).is_some() {
            return Err(StorageError::RowAlreadyExists {
                table: table.clone(),
                key: row.key,
            });
        }

        {
            let data = self.store.data.read();
            if let Some(latest) = data.table(table)?.get(&row.key).and_then(|c| c.last()) {
                if tx.isolation.uses_snapshot() && latest.commit > tx.snapshot {
                    return Err(StorageError::conflict(
                        ConflictKind::Serialization,
                        format!("{}/{} was created after the snapshot", table, row.key),
                    ));
                }
                return Err(StorageError::RowAlreadyExists {
                    table: table.clone(),
                    key: row.key,
                });
            }
        }

        row.version = 1;
        tx.writes.push(Write {
            table: table.clone(),
            row: row.clone(),
        });
        Ok(row)
    }

    fn update_row(&mut self, table: &TableName, mut row: Row) -> StorageResult<Row> {
        self.lock_for_write(table, &row.key)?;
        let tx = self
            .tx
            .as_mut()
            .ok_or(StorageError::NoActiveTransaction(self.id))?;

        let current = match tx.pending(table, &row.key) {
            Some(pending) => pending.clone(),
            None => {
                let data = self.store.data.read();
                let chain = data.table(table)?.get(&row.key);
                if let Some(latest) = chain.and_then(|c| c.last()) {
                    if tx.isolation.uses_snapshot() && latest.commit > tx.snapshot {
                        return Err(StorageError::conflict(
                            ConflictKind::Serialization,
                            format!("{}/{} changed after the snapshot", table, row.key),
                        ));
                    }
                }
                chain
                    .and_then(|c| visible(c, tx.read_snapshot()))
                    .cloned()
                    .ok_or_else(|| StorageError::RowNotFound {
                        table: table.clone(),
                        key: row.key.clone(),
                    })?
            }
        };

        row.version = current.version + 1;
        row.created_at = current.created_at;
        row.updated_at = Utc::now();
        tx.writes.push(Write {
            table: table.clone(),
            row: row.clone(),
        });
        Ok(row)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!(conn = self.id, "connection dropped with open transaction, rolling back");
            self.end_transaction();
        }

        let mut pool = self.store.pool.lock();
        pool.in_use = pool.in_use.saturating_sub(1);
        pool.released += 1;
        drop(pool);
        self.store.pool_freed.notify_one();
        trace!(conn = self.id, "connection released");
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.tx.is_some())
            .finish()
    }
}
