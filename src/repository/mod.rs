//! Per-table record access for steps.
//!
//! [`Records`] is the create/read/update/soft-delete surface the service
//! layer builds its steps from. Every call runs on the caller's
//! [`TransactionContext`], so reads see the transaction's own writes and
//! nothing becomes visible to others before the unit of work commits.
//!
//! Soft-deleted rows (those with `deleted_at` set) are invisible to every
//! read here: `find_one` reports them as not found and `find_many` skips
//! them.

mod filter;

pub use filter::{Condition, Filter, Page, DEFAULT_PAGE_LIMIT};

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::storage::{Connection, Row, RowKey, TableName};
use crate::transaction::{TransactionContext, TransactionError, TransactionResult};

/// Record access for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Records {
    table: TableName,
}

impl Records {
    pub fn new(table: TableName) -> Self {
        Self { table }
    }

    /// Records for a table given by name.
    pub fn for_table(name: &str) -> TransactionResult<Self> {
        let table = TableName::new(name)
            .map_err(|e| TransactionError::validation(format!("table name '{}': {}", name, e)))?;
        Ok(Self::new(table))
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Read a live row, failing with `NotFound` if it is missing or soft-deleted.
    pub fn find_one<C: Connection>(
        &self,
        ctx: &TransactionContext<C>,
        key: &RowKey,
    ) -> TransactionResult<Row> {
        self.find_optional(ctx, key)?
            .ok_or_else(|| TransactionError::not_found(&self.table, key))
    }

    /// Read a live row if there is one.
    pub fn find_optional<C: Connection>(
        &self,
        ctx: &TransactionContext<C>,
        key: &RowKey,
    ) -> TransactionResult<Option<Row>> {
        let row = ctx.rows().read_row(&self.table, key)?;
        Ok(row.filter(|r| !r.is_deleted()))
    }

    /// Check if a live row exists.
    pub fn exists<C: Connection>(
        &self,
        ctx: &TransactionContext<C>,
        key: &RowKey,
    ) -> TransactionResult<bool> {
        Ok(self.find_optional(ctx, key)?.is_some())
    }

    /// Live rows matching `filter`, in key order, windowed by `page`.
    pub fn find_many<C: Connection>(
        &self,
        ctx: &TransactionContext<C>,
        filter: &Filter,
        page: Page,
    ) -> TransactionResult<Vec<Row>> {
        let rows = ctx.rows().scan_table(&self.table)?;
        Ok(rows
            .into_iter()
            .filter(|r| !r.is_deleted() && filter.matches(r))
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    /// Count live rows matching `filter`.
    pub fn count<C: Connection>(
        &self,
        ctx: &TransactionContext<C>,
        filter: &Filter,
    ) -> TransactionResult<usize> {
        let rows = ctx.rows().scan_table(&self.table)?;
        Ok(rows
            .iter()
            .filter(|r| !r.is_deleted() && filter.matches(r))
            .count())
    }

    /// Insert a row under a freshly generated key. `data` must be a JSON object.
    pub fn insert<C: Connection>(
        &self,
        ctx: &mut TransactionContext<C>,
        data: Value,
    ) -> TransactionResult<Row> {
        self.insert_with_key(ctx, RowKey::generate(), data)
    }

    pub fn insert_with_key<C: Connection>(
        &self,
        ctx: &mut TransactionContext<C>,
        key: RowKey,
        data: Value,
    ) -> TransactionResult<Row> {
        let row = Row::new(key, object_fields(data)?);
        let row = ctx.rows_mut().insert_row(&self.table, row)?;
        debug!(tx_id = %ctx.id(), table = %self.table, key = %row.key, "row inserted");
        Ok(row)
    }

    /// Merge `patch` (a JSON object) into a live row.
    pub fn update<C: Connection>(
        &self,
        ctx: &mut TransactionContext<C>,
        key: &RowKey,
        patch: Value,
    ) -> TransactionResult<Row> {
        let updates = object_fields(patch)?;
        let mut row = self.find_one(ctx, key)?;
        row.merge_data(updates);
        let row = ctx.rows_mut().update_row(&self.table, row)?;
        debug!(tx_id = %ctx.id(), table = %self.table, key = %row.key, version = row.version, "row updated");
        Ok(row)
    }

    /// Mark a live row deleted. It stays stored but no read here sees it again.
    pub fn soft_delete<C: Connection>(
        &self,
        ctx: &mut TransactionContext<C>,
        key: &RowKey,
    ) -> TransactionResult<Row> {
        let mut row = self.find_one(ctx, key)?;
        row.mark_deleted();
        let row = ctx.rows_mut().update_row(&self.table, row)?;
        debug!(tx_id = %ctx.id(), table = %self.table, key = %row.key, "row soft-deleted");
        Ok(row)
    }
}

fn object_fields(value: Value) -> TransactionResult<BTreeMap<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(TransactionError::validation(format!(
            "record data must be a JSON object, got {}",
            other
        ))),
    }
}
