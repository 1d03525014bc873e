//! Row filters and pagination for `find_many`.

use serde_json::Value;

use crate::storage::Row;

/// Default page size when the caller does not choose one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// One column condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    NotEq(String, Value),
    /// column absent or JSON null
    IsNull(String),
}

impl Condition {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq(column, expected) => {
                row.get(column).is_some_and(|v| values_equal(v, expected))
            }
            Condition::NotEq(column, expected) => {
                !row.get(column).is_some_and(|v| values_equal(v, expected))
            }
            Condition::IsNull(column) => row.get(column).map_or(true, Value::is_null),
        }
    }
}

/// Conjunction of column conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `column == value`.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column.into(), value.into()));
        self
    }

    /// Require `column != value` (rows without the column pass).
    pub fn not_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::NotEq(column.into(), value.into()));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.conditions.push(Condition::IsNull(column.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Check a row against every condition.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

/// Offset/limit window over a key-ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// The first `limit` rows.
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    /// The page after this one.
    pub fn next(&self) -> Self {
        Self {
            offset: self.offset.saturating_add(self.limit),
            limit: self.limit,
        }
    }
}

/// Check if two JSON values are equal; numbers compare by value.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .is_some_and(|(x, y)| (x - y).abs() < f64::EPSILON),
        _ => a == b,
    }
}
