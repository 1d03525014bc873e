//! core value types for the storage layer: validated names and rows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::storage::errors::{StorageError, StorageResult};

/// Character rules shared by table names and row keys.
struct NameRules {
    max_len: usize,
    letter_first: bool,
    reserved: &'static [&'static str],
}

impl NameRules {
    /// ASCII letters, digits, `_` and `-`.
    fn check(&self, name: &str) -> Result<(), InvalidNameError> {
        let first = name.chars().next().ok_or(InvalidNameError::Empty)?;
        if name.len() > self.max_len {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if self.letter_first && !(first.is_ascii_alphabetic() || first == '_') {
            return Err(InvalidNameError::InvalidStart(first));
        }
        if let Some((position, char)) = name
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(InvalidNameError::InvalidCharacter { char, position });
        }
        if self.reserved.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(InvalidNameError::Reserved(name.to_string()));
        }
        Ok(())
    }
}

/// A validated table name: 1-64 characters, starting with a letter or
/// underscore, not one of the store's reserved names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    const RULES: NameRules = NameRules {
        max_len: 64,
        letter_first: true,
        reserved: &["_schema", "_meta", "_system"],
    };

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::RULES.check(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A validated row key (primary key), up to 128 characters.
///
/// Keys are normally generated ULIDs, which sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RowKey(String);

impl RowKey {
    const RULES: NameRules = NameRules {
        max_len: 128,
        letter_first: false,
        reserved: &[],
    };

    pub fn new(key: impl Into<String>) -> Result<Self, InvalidNameError> {
        let key = key.into();
        Self::RULES.check(&key)?;
        Ok(Self(key))
    }

    /// A fresh lowercase ULID key.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_newtype {
    ($($name:ident),*) => {$(
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidNameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }
    )*};
}

string_newtype!(TableName, RowKey);

/// A stored record: primary key, bookkeeping and column values.
///
/// `version` counts writes to this row and is maintained by the store;
/// callers never need to bump it themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// set when the row has been soft-deleted
    pub deleted_at: Option<DateTime<Utc>>,
    pub data: BTreeMap<String, Value>,
}

impl Row {
    /// creates a new row with key & data at version 1
    pub fn new(key: RowKey, data: BTreeMap<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            key,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            data,
        }
    }

    /// create a new row from a JSON object
    pub fn from_value(key: RowKey, value: Value) -> StorageResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::new(key, map.into_iter().collect())),
            _ => Err(StorageError::SchemaViolation(
                "row data must be a JSON object".to_string(),
            )),
        }
    }

    /// merge new data into existing data (partial update)
    pub fn merge_data(&mut self, updates: BTreeMap<String, Value>) {
        self.data.extend(updates);
    }

    /// mark the row as soft-deleted
    pub fn mark_deleted(&mut self) {
        self.deleted_at = Some(Utc::now());
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// get a column value by name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    /// get a string column value by name
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.data.get(column).and_then(Value::as_str)
    }
}

/// Why a table name or row key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidNameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name too long: {0} characters")]
    TooLong(usize),
    #[error("name cannot start with '{0}'")]
    InvalidStart(char),
    #[error("invalid character '{char}' at position {position}")]
    InvalidCharacter { char: char, position: usize },
    #[error("'{0}' is a reserved name")]
    Reserved(String),
}
