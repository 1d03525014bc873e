//! Shared setup for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::json;
use txcontrol::repository::Records;
use txcontrol::storage::{Row, RowKey};
use txcontrol::{MemoryStore, StoreConfig, TransactionController};

/// Route tracing output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A store with one `accounts` table and short lock waits.
pub fn accounts_store() -> (MemoryStore, Records, TransactionController<MemoryStore>) {
    init_tracing();
    let store = MemoryStore::new(
        StoreConfig::default()
            .lock_timeout(Duration::from_millis(500))
            .acquire_timeout(Duration::from_millis(200)),
    );
    let accounts = Records::for_table("accounts").unwrap();
    store.create_table(accounts.table()).unwrap();
    let controller = TransactionController::new(store.clone());
    controller.set_retry_config(3, Duration::from_millis(5));
    (store, accounts, controller)
}

/// Seed an account row with a fixed key.
pub fn seed_account(
    controller: &TransactionController<MemoryStore>,
    accounts: &Records,
    key: &str,
    balance: i64,
) -> Row {
    let key = RowKey::new(key).unwrap();
    controller
        .execute(None, |ctx| {
            accounts.insert_with_key(ctx, key, json!({ "balance": balance }))
        })
        .unwrap()
}

pub fn balance(row: &Row) -> i64 {
    row.get("balance").and_then(|v| v.as_i64()).unwrap_or_default()
}
