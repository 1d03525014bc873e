//! Transaction controller - runs units of work.
//!
//! The TransactionController is the main entry point for transactions.
//! It handles:
//! - Connection acquisition and release around every unit of work
//! - Running single steps and ordered, dependent step lists atomically
//! - Nesting through savepoints when a caller passes an open context
//! - Retrying units of work that hit store-reported conflicts

use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::config::ControllerConfig;
use crate::storage::{Connection, ConnectionSource};
use crate::transaction::context::TransactionContext;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::retry::{RetryPolicy, RetryState};
use crate::transaction::savepoint::SavepointManager;

/// One step of a dependent unit of work.
pub type Step<'a, C, T> =
    Box<dyn FnOnce(&mut TransactionContext<C>) -> TransactionResult<T> + 'a>;

/// Box a closure as a [`Step`].
pub fn step<'a, C, T, F>(f: F) -> Step<'a, C, T>
where
    C: Connection,
    F: FnOnce(&mut TransactionContext<C>) -> TransactionResult<T> + 'a,
{
    Box::new(f)
}

/// Transaction controller - orchestrates units of work against a connection source.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
pub struct TransactionController<S: ConnectionSource> {
    inner: Arc<ControllerInner<S>>,
}

struct ControllerInner<S> {
    source: S,
    config: RwLock<ControllerConfig>,
    savepoints: SavepointManager,
}

impl<S: ConnectionSource> Clone for TransactionController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ConnectionSource> TransactionController<S> {
    /// Create a controller with default configuration.
    pub fn new(source: S) -> Self {
        Self::with_config(source, ControllerConfig::default())
    }

    pub fn with_config(source: S, config: ControllerConfig) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                source,
                config: RwLock::new(config),
                savepoints: SavepointManager::new(),
            }),
        }
    }

    /// Get a reference to the underlying connection source.
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    // ==================== Configuration ====================

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ControllerConfig {
        self.inner.config.read().clone()
    }

    pub fn default_isolation_level(&self) -> IsolationLevel {
        self.inner.config.read().default_isolation
    }

    /// Change the level used when callers pass `None`. Affects future calls only.
    pub fn set_default_isolation_level(&self, level: IsolationLevel) {
        self.inner.config.write().default_isolation = level;
        debug!(%level, "default isolation level changed");
    }

    /// Change the retry budget and base delay. Affects future calls only.
    pub fn set_retry_config(&self, max_attempts: u32, base_delay: std::time::Duration) {
        let mut config = self.inner.config.write();
        *config = config.clone().retry(max_attempts, base_delay);
        debug!(
            max_attempts = config.max_retry_attempts,
            base_delay_ms = config.base_retry_delay_ms,
            "retry configuration changed"
        );
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.inner.config.read())
    }

    // ==================== Single step ====================

    /// Run one step in its own transaction.
    ///
    /// Commits if the step returns Ok, rolls back if it returns Err or
    /// panics. The connection is released on every path.
    pub fn execute<T, F>(&self, isolation: Option<IsolationLevel>, step: F) -> TransactionResult<T>
    where
        F: FnOnce(&mut TransactionContext<S::Conn>) -> TransactionResult<T>,
    {
        let mut ctx = self.begin(isolation)?;
        let outcome = step(&mut ctx);
        self.finish(ctx, outcome)
    }

    /// Run one step, nested in `reuse` if given, otherwise in a new transaction.
    ///
    /// A nested call runs at the parent's isolation level; asking for a
    /// stricter level than the parent has is rejected.
    pub fn execute_reusing<T, F>(
        &self,
        reuse: Option<&mut TransactionContext<S::Conn>>,
        isolation: Option<IsolationLevel>,
        step: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&mut TransactionContext<S::Conn>) -> TransactionResult<T>,
    {
        match reuse {
            Some(ctx) => {
                Self::check_nested_isolation(ctx, isolation)?;
                self.execute_within(ctx, step)
            }
            None => self.execute(isolation, step),
        }
    }

    /// Run one step as a nested unit of work inside an open transaction.
    ///
    /// If the step fails only its own effects are undone; the parent
    /// transaction stays open and can still commit.
    pub fn execute_within<T, F>(
        &self,
        ctx: &mut TransactionContext<S::Conn>,
        step: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(&mut TransactionContext<S::Conn>) -> TransactionResult<T>,
    {
        self.inner.savepoints.with_savepoint(ctx, step)
    }

    // ==================== Dependent steps ====================

    /// Run steps in order in one transaction; step N+1 runs only if step N
    /// succeeded.
    ///
    /// Returns every step's result in input order, or the first failure
    /// wrapped with its 1-based step index, after rolling back everything.
    pub fn execute_dependent<'a, T>(
        &self,
        isolation: Option<IsolationLevel>,
        steps: Vec<Step<'a, S::Conn, T>>,
    ) -> TransactionResult<Vec<T>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }
        let mut ctx = self.begin(isolation)?;
        let outcome = Self::run_steps(&mut ctx, steps);
        self.finish(ctx, outcome)
    }

    /// Run dependent steps as one nested unit of work inside an open transaction.
    pub fn execute_dependent_within<'a, T>(
        &self,
        ctx: &mut TransactionContext<S::Conn>,
        steps: Vec<Step<'a, S::Conn, T>>,
    ) -> TransactionResult<Vec<T>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }
        self.inner
            .savepoints
            .with_savepoint(ctx, |ctx| Self::run_steps(ctx, steps))
    }

    fn run_steps<'a, T>(
        ctx: &mut TransactionContext<S::Conn>,
        steps: Vec<Step<'a, S::Conn, T>>,
    ) -> TransactionResult<Vec<T>> {
        let total = steps.len();
        let mut results = Vec::with_capacity(total);
        for (i, step) in steps.into_iter().enumerate() {
            let index = i + 1;
            match step(ctx) {
                Ok(value) => {
                    debug!(tx_id = %ctx.id(), step = index, total, "step succeeded");
                    results.push(value);
                }
                Err(e) => {
                    warn!(tx_id = %ctx.id(), step = index, total, error = %e, "step failed, skipping remaining steps");
                    return Err(TransactionError::step(index, e));
                }
            }
        }
        Ok(results)
    }

    // ==================== Retry ====================

    /// Run one step in its own transaction, retrying on conflicts.
    ///
    /// Between attempts the calling thread sleeps `base * 2^(k-1)` after
    /// attempt k; the failed attempt's connection is already released by
    /// then. The step may therefore run several times.
    pub fn execute_with_retry<T, F>(
        &self,
        isolation: Option<IsolationLevel>,
        mut step: F,
    ) -> TransactionResult<T>
    where
        F: FnMut(&mut TransactionContext<S::Conn>) -> TransactionResult<T>,
    {
        let isolation = Some(self.resolve_isolation(isolation));
        self.retrying(|_| self.execute(isolation, &mut step))
    }

    /// Run a dependent unit of work, retrying the whole of it on conflicts.
    ///
    /// `make_steps` builds a fresh step list for every attempt.
    pub fn execute_dependent_with_retry<'a, T, F>(
        &self,
        isolation: Option<IsolationLevel>,
        mut make_steps: F,
    ) -> TransactionResult<Vec<T>>
    where
        F: FnMut() -> Vec<Step<'a, S::Conn, T>>,
    {
        let isolation = Some(self.resolve_isolation(isolation));
        self.retrying(|_| self.execute_dependent(isolation, make_steps()))
    }

    fn retrying<T, F>(&self, mut attempt_fn: F) -> TransactionResult<T>
    where
        F: FnMut(u32) -> TransactionResult<T>,
    {
        let policy = self.retry_policy();
        let mut state = RetryState::new();

        loop {
            let attempt = state.begin_attempt();
            let err = match attempt_fn(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, total_delay_ms = state.total_delay.as_millis() as u64, "unit of work succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !policy.is_retryable(&err) {
                return Err(err);
            }
            if !policy.has_attempts_left(attempt) {
                warn!(attempt, error = %err, "retry budget exhausted");
                return Err(err);
            }

            let delay = policy.delay_for(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "conflict, retrying");
            state.record_delay(delay);
            thread::sleep(delay);
        }
    }

    // ==================== Lifecycle ====================

    fn resolve_isolation(&self, isolation: Option<IsolationLevel>) -> IsolationLevel {
        isolation.unwrap_or_else(|| self.default_isolation_level())
    }

    fn check_nested_isolation(
        ctx: &TransactionContext<S::Conn>,
        requested: Option<IsolationLevel>,
    ) -> TransactionResult<()> {
        match requested {
            Some(level) if !ctx.isolation().satisfies(level) => {
                Err(TransactionError::InvalidOperation(format!(
                    "nested unit of work asked for {} inside a {} transaction",
                    level,
                    ctx.isolation()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Acquire a connection and begin a transaction on it.
    fn begin(&self, isolation: Option<IsolationLevel>) -> TransactionResult<TransactionContext<S::Conn>> {
        let isolation = self.resolve_isolation(isolation);
        let conn = self.inner.source.acquire()?;
        let ctx = TransactionContext::begin(conn, isolation)?;
        debug!(tx_id = %ctx.id(), conn = ctx.metadata().connection_id, %isolation, "transaction started");
        Ok(ctx)
    }

    /// Commit on success, roll back on failure. Either way the context is
    /// consumed and its connection released.
    fn finish<T>(
        &self,
        ctx: TransactionContext<S::Conn>,
        outcome: TransactionResult<T>,
    ) -> TransactionResult<T> {
        let tx_id = ctx.id().to_string();
        match outcome {
            Ok(value) => match ctx.commit() {
                Ok(()) => {
                    debug!(%tx_id, "transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    warn!(%tx_id, error = %e, "commit failed");
                    Err(e)
                }
            },
            Err(err) => match ctx.rollback() {
                Ok(()) => {
                    debug!(%tx_id, error = %err, "transaction rolled back");
                    Err(err)
                }
                Err(rollback_err) => {
                    error!(%tx_id, error = %err, rollback_error = %rollback_err, "rollback failed");
                    Err(err.with_rollback_failure(rollback_err))
                }
            },
        }
    }
}

impl<S: ConnectionSource> std::fmt::Debug for TransactionController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionController")
            .field("config", &*self.inner.config.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::panic::{self, AssertUnwindSafe};
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use crate::storage::{
        ConflictKind, MemoryConnection, MemoryStore, Row, RowAccess, RowKey, StorageError,
        StorageResult, TableName,
    };

    // ---------- scripted connection for exit-path accounting ----------

    #[derive(Default)]
    struct Script {
        log: Vec<String>,
        fail_begin: bool,
        fail_commit: bool,
        fail_rollback: bool,
        fail_release: bool,
        acquired: usize,
        released: usize,
    }

    #[derive(Clone, Default)]
    struct ScriptedSource {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedSource {
        fn log(&self) -> Vec<String> {
            self.script.lock().log.clone()
        }

        fn counts(&self) -> (usize, usize) {
            let script = self.script.lock();
            (script.acquired, script.released)
        }
    }

    struct ScriptedConnection {
        id: u64,
        open: bool,
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedConnection {
        fn record(&self, entry: impl Into<String>) {
            self.script.lock().log.push(entry.into());
        }
    }

    impl Connection for ScriptedConnection {
        fn id(&self) -> u64 {
            self.id
        }

        fn in_transaction(&self) -> bool {
            self.open
        }

        fn begin(&mut self, isolation: IsolationLevel) -> StorageResult<()> {
            self.record(format!("BEGIN {}", isolation));
            if self.script.lock().fail_begin {
                return Err(StorageError::ConnectionClosed("begin refused".into()));
            }
            self.open = true;
            Ok(())
        }

        fn commit(&mut self) -> StorageResult<()> {
            self.record("COMMIT");
            self.open = false;
            if self.script.lock().fail_commit {
                return Err(StorageError::conflict(ConflictKind::Serialization, "commit refused"));
            }
            Ok(())
        }

        fn rollback(&mut self) -> StorageResult<()> {
            self.record("ROLLBACK");
            self.open = false;
            if self.script.lock().fail_rollback {
                return Err(StorageError::ConnectionClosed("rollback refused".into()));
            }
            Ok(())
        }

        fn execute_raw(&mut self, statement: &str) -> StorageResult<()> {
            self.record(statement);
            if self.script.lock().fail_release && statement.starts_with("RELEASE") {
                return Err(StorageError::UnknownSavepoint(statement.to_string()));
            }
            Ok(())
        }
    }

    impl RowAccess for ScriptedConnection {
        fn read_row(&self, _: &TableName, _: &RowKey) -> StorageResult<Option<Row>> {
            Ok(None)
        }

        fn scan_table(&self, _: &TableName) -> StorageResult<Vec<Row>> {
            Ok(Vec::new())
        }

        fn insert_row(&mut self, _: &TableName, row: Row) -> StorageResult<Row> {
            self.record(format!("INSERT {}", row.key));
            Ok(row)
        }

        fn update_row(&mut self, _: &TableName, row: Row) -> StorageResult<Row> {
            Ok(row)
        }
    }

    impl Drop for ScriptedConnection {
        fn drop(&mut self) {
            self.script.lock().released += 1;
        }
    }

    impl ConnectionSource for ScriptedSource {
        type Conn = ScriptedConnection;

        fn acquire(&self) -> StorageResult<ScriptedConnection> {
            let mut script = self.script.lock();
            script.acquired += 1;
            Ok(ScriptedConnection {
                id: script.acquired as u64,
                open: false,
                script: Arc::clone(&self.script),
            })
        }
    }

    fn scripted() -> (ScriptedSource, TransactionController<ScriptedSource>) {
        let source = ScriptedSource::default();
        let controller = TransactionController::new(source.clone());
        (source, controller)
    }

    // ---------- memory store helpers ----------

    fn memory() -> (MemoryStore, TableName, TransactionController<MemoryStore>) {
        let store = MemoryStore::default();
        let table = TableName::new("items").unwrap();
        store.create_table(&table).unwrap();
        let controller = TransactionController::new(store.clone());
        (store, table, controller)
    }

    fn item(name: &str) -> Row {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), serde_json::Value::String(name.to_string()));
        Row::new(RowKey::generate(), data)
    }

    // ---------- execute ----------

    #[test]
    fn test_execute_commits_on_success() {
        let (source, controller) = scripted();
        let value = controller.execute(None, |_| Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(source.log(), vec!["BEGIN READ COMMITTED", "COMMIT"]);
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_execute_rolls_back_on_failure() {
        let (source, controller) = scripted();
        let result: TransactionResult<()> = controller.execute(Some(IsolationLevel::Serializable), |_| {
            Err(TransactionError::validation("nope"))
        });
        assert!(matches!(result, Err(TransactionError::Validation(_))));
        assert_eq!(source.log(), vec!["BEGIN SERIALIZABLE", "ROLLBACK"]);
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_commit_failure_releases_once() {
        let (source, controller) = scripted();
        source.script.lock().fail_commit = true;

        let err = controller.execute(None, |_| Ok(())).unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::Serialization));
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_begin_failure_releases_once() {
        let (source, controller) = scripted();
        source.script.lock().fail_begin = true;

        let mut ran = false;
        let err = controller
            .execute(None, |_| {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(!ran);
        assert!(matches!(err, TransactionError::Connection(_)));
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_rollback_failure_is_secondary() {
        let (source, controller) = scripted();
        source.script.lock().fail_rollback = true;

        let err = controller
            .execute::<(), _>(None, |_| Err(TransactionError::validation("primary")))
            .unwrap_err();
        assert!(matches!(err.primary(), TransactionError::Validation(_)));
        assert!(matches!(
            err.rollback_failure(),
            Some(TransactionError::Connection(_))
        ));
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_panicking_step_rolls_back_and_releases() {
        let (source, controller) = scripted();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            controller.execute::<(), _>(None, |_| panic!("step exploded"))
        }));
        assert!(result.is_err());
        assert_eq!(source.log(), vec!["BEGIN READ COMMITTED", "ROLLBACK"]);
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_default_isolation_is_configurable() {
        let (source, controller) = scripted();
        controller.set_default_isolation_level(IsolationLevel::RepeatableRead);
        controller.execute(None, |_| Ok(())).unwrap();
        controller
            .execute(Some(IsolationLevel::ReadUncommitted), |_| Ok(()))
            .unwrap();
        assert_eq!(
            source.log(),
            vec![
                "BEGIN REPEATABLE READ",
                "COMMIT",
                "BEGIN READ UNCOMMITTED",
                "COMMIT"
            ]
        );
    }

    // ---------- nesting ----------

    #[test]
    fn test_nested_execute_uses_savepoint() {
        let (source, controller) = scripted();
        controller
            .execute(None, |ctx| {
                controller.execute_reusing(Some(&mut *ctx), None, |_| Ok(()))?;
                let nested: TransactionResult<()> =
                    controller.execute_within(ctx, |_| Err(TransactionError::validation("inner")));
                assert!(nested.is_err());
                Ok(())
            })
            .unwrap();

        assert_eq!(
            source.log(),
            vec![
                "BEGIN READ COMMITTED",
                "SAVEPOINT sp_1",
                "RELEASE SAVEPOINT sp_1",
                "SAVEPOINT sp_2",
                "ROLLBACK TO SAVEPOINT sp_2",
                "RELEASE SAVEPOINT sp_2",
                "COMMIT"
            ]
        );
        // nesting never acquires a second connection
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_nested_release_failure_rolls_back_to_savepoint() {
        let (source, controller) = scripted();
        source.script.lock().fail_release = true;
        controller
            .execute(None, |ctx| {
                let nested = controller.execute_within(ctx, |_| Ok(()));
                assert!(matches!(nested, Err(TransactionError::RollbackFailed { .. })));
                Ok(())
            })
            .unwrap();

        assert_eq!(
            source.log(),
            vec![
                "BEGIN READ COMMITTED",
                "SAVEPOINT sp_1",
                "RELEASE SAVEPOINT sp_1",
                "ROLLBACK TO SAVEPOINT sp_1",
                "RELEASE SAVEPOINT sp_1",
                "COMMIT"
            ]
        );
    }

    #[test]
    fn test_execute_reusing_none_opens_transaction() {
        let (source, controller) = scripted();
        controller.execute_reusing(None, None, |_| Ok(())).unwrap();
        assert_eq!(source.log(), vec!["BEGIN READ COMMITTED", "COMMIT"]);
    }

    #[test]
    fn test_nested_stricter_isolation_rejected() {
        let (_source, controller) = scripted();
        let result = controller.execute(Some(IsolationLevel::ReadCommitted), |ctx| {
            controller.execute_reusing(Some(ctx), Some(IsolationLevel::Serializable), |_| Ok(()))
        });
        assert!(matches!(result, Err(TransactionError::InvalidOperation(_))));

        let result = controller.execute(Some(IsolationLevel::Serializable), |ctx| {
            controller.execute_reusing(Some(ctx), Some(IsolationLevel::ReadCommitted), |_| Ok(7))
        });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_nested_failure_keeps_outer_effects() {
        let (store, table, controller) = memory();
        controller
            .execute(None, |ctx| {
                ctx.rows_mut().insert_row(&table, item("outer"))?;
                let nested: TransactionResult<()> = controller.execute_within(ctx, |ctx| {
                    ctx.rows_mut().insert_row(&table, item("inner"))?;
                    Err(TransactionError::validation("inner failed"))
                });
                assert!(nested.is_err());
                Ok(())
            })
            .unwrap();

        let rows = store.committed_rows(&table).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("name"), Some("outer"));
    }

    // ---------- dependent steps ----------

    #[test]
    fn test_dependent_returns_results_in_order() {
        let (_source, controller) = scripted();
        let steps: Vec<Step<'_, ScriptedConnection, i32>> =
            vec![step(|_| Ok(1)), step(|_| Ok(2)), step(|_| Ok(3))];
        assert_eq!(controller.execute_dependent(None, steps).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dependent_stops_at_first_failure() {
        let (source, controller) = scripted();
        let mut third_ran = false;
        {
            let steps: Vec<Step<'_, ScriptedConnection, ()>> = vec![
                step(|_| Ok(())),
                step(|_| Err(TransactionError::validation("parent missing"))),
                step(|_| {
                    third_ran = true;
                    Ok(())
                }),
            ];
            let err = controller.execute_dependent(None, steps).unwrap_err();
            assert_eq!(err.failed_step(), Some(2));
            assert!(matches!(err.primary(), TransactionError::Validation(_)));
        }
        assert!(!third_ran);
        assert_eq!(source.log(), vec!["BEGIN READ COMMITTED", "ROLLBACK"]);
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_dependent_empty_list() {
        let (source, controller) = scripted();
        let steps: Vec<Step<'_, ScriptedConnection, ()>> = Vec::new();
        assert!(controller.execute_dependent(None, steps).unwrap().is_empty());
        assert_eq!(source.counts(), (0, 0));
    }

    #[test]
    fn test_dependent_failure_undoes_earlier_steps() {
        let (store, table, controller) = memory();
        let steps: Vec<Step<'_, MemoryConnection, Row>> = vec![
            step(|ctx: &mut TransactionContext<MemoryConnection>| {
                Ok(ctx.rows_mut().insert_row(&table, item("first"))?)
            }),
            step(|ctx: &mut TransactionContext<MemoryConnection>| {
                Ok(ctx.rows_mut().insert_row(&table, item("second"))?)
            }),
            step(|_| Err(TransactionError::validation("third refuses"))),
        ];
        let err = controller
            .execute_dependent(Some(IsolationLevel::Serializable), steps)
            .unwrap_err();
        assert_eq!(err.failed_step(), Some(3));
        assert!(store.committed_rows(&table).unwrap().is_empty());
        assert_eq!(store.pool_stats().in_use, 0);
    }

    #[test]
    fn test_dependent_within_nests_as_one_savepoint() {
        let (store, table, controller) = memory();
        controller
            .execute(None, |ctx| {
                ctx.rows_mut().insert_row(&table, item("outer"))?;
                let steps: Vec<Step<'_, MemoryConnection, Row>> = vec![
                    step(|ctx: &mut TransactionContext<MemoryConnection>| {
                        Ok(ctx.rows_mut().insert_row(&table, item("a"))?)
                    }),
                    step(|_| Err(TransactionError::validation("b refuses"))),
                ];
                let nested = controller.execute_dependent_within(ctx, steps);
                assert_eq!(nested.unwrap_err().failed_step(), Some(2));
                Ok(())
            })
            .unwrap();

        let rows = store.committed_rows(&table).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("name"), Some("outer"));
    }

    // ---------- retry ----------

    #[test]
    fn test_retry_stops_after_budget() {
        let (source, controller) = scripted();
        controller.set_retry_config(3, Duration::from_millis(10));

        let mut attempts = 0;
        let started = Instant::now();
        let err = controller
            .execute_with_retry::<(), _>(None, |_| {
                attempts += 1;
                Err(TransactionError::Conflict {
                    kind: ConflictKind::Deadlock,
                    detail: "always".into(),
                })
            })
            .unwrap_err();

        assert_eq!(attempts, 3);
        assert_eq!(err.conflict_kind(), Some(ConflictKind::Deadlock));
        // slept 10ms + 20ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(30));
        // every attempt released its connection
        assert_eq!(source.counts(), (3, 3));
    }

    #[test]
    fn test_retry_recovers_from_conflict() {
        let (_source, controller) = scripted();
        controller.set_retry_config(5, Duration::from_millis(1));

        let mut attempts = 0;
        let value = controller
            .execute_with_retry(None, |_| {
                attempts += 1;
                if attempts < 3 {
                    Err(TransactionError::Conflict {
                        kind: ConflictKind::Serialization,
                        detail: "try again".into(),
                    })
                } else {
                    Ok(attempts)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_retry_skips_non_retryable() {
        let (_source, controller) = scripted();
        controller.set_retry_config(5, Duration::from_millis(1));

        let mut attempts = 0;
        let err = controller
            .execute_with_retry::<(), _>(None, |_| {
                attempts += 1;
                Err(TransactionError::validation("bad input"))
            })
            .unwrap_err();
        assert_eq!(attempts, 1);
        assert!(matches!(err, TransactionError::Validation(_)));
    }

    #[test]
    fn test_retry_keeps_resolved_isolation() {
        let (source, controller) = scripted();
        controller.set_retry_config(2, Duration::from_millis(1));
        controller.set_default_isolation_level(IsolationLevel::Serializable);

        let _ = controller.execute_with_retry::<(), _>(None, |_| {
            Err(TransactionError::Conflict {
                kind: ConflictKind::LockTimeout,
                detail: String::new(),
            })
        });
        let begins: Vec<String> = source
            .log()
            .into_iter()
            .filter(|entry| entry.starts_with("BEGIN"))
            .collect();
        assert_eq!(begins, vec!["BEGIN SERIALIZABLE", "BEGIN SERIALIZABLE"]);
    }

    #[test]
    fn test_dependent_with_retry_rebuilds_steps() {
        let (_source, controller) = scripted();
        controller.set_retry_config(3, Duration::from_millis(1));

        let mut built = 0;
        let results = controller
            .execute_dependent_with_retry(None, || {
                built += 1;
                let fail = built == 1;
                let steps: Vec<Step<'_, ScriptedConnection, u32>> = vec![
                    step(|_| Ok(1)),
                    step(move |_| {
                        if fail {
                            Err(TransactionError::Conflict {
                                kind: ConflictKind::Deadlock,
                                detail: "first attempt".into(),
                            })
                        } else {
                            Ok(2)
                        }
                    }),
                ];
                steps
            })
            .unwrap();
        assert_eq!(results, vec![1, 2]);
        assert_eq!(built, 2);
    }
}
