//! User and todo services.
//!
//! Each service operation is one unit of work on a [`TransactionController`].
//! Operations that validate one record and then write another are built as
//! dependent step lists, so the check and the write share a transaction and
//! nothing can slip in between them.
//!
//! [`TransactionController`]: crate::transaction::TransactionController

mod error;
mod todos;
mod users;

pub use error::{ServiceError, ServiceResult};
pub use todos::TodoService;
pub use users::UserService;

use crate::storage::{MemoryStore, Row, StorageResult, TableName};
use crate::transaction::TransactionError;

/// Table holding user records: `email`, `name`.
pub const USERS_TABLE: &str = "users";
/// Table holding todo records: `owner_id`, `title`, `done`, `completed_at`.
pub const TODOS_TABLE: &str = "todos";

/// Create the service tables in a memory store, skipping ones that exist.
pub fn install_tables(store: &MemoryStore) -> StorageResult<()> {
    for name in [USERS_TABLE, TODOS_TABLE] {
        let table = TableName::new(name)?;
        if !store.table_exists(&table) {
            store.create_table(&table)?;
        }
    }
    Ok(())
}

/// The row produced by the last step of a `[check, write]` unit of work.
pub(crate) fn last_row(mut results: Vec<Option<Row>>) -> ServiceResult<Row> {
    results.pop().flatten().ok_or_else(|| {
        ServiceError::Internal(TransactionError::InvalidOperation(
            "unit of work produced no row".into(),
        ))
    })
}
