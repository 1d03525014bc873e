//! Todo operations.
//!
//! Every write first checks that the owning user still exists, then touches
//! the todo. Both steps run in one serializable unit of work, so a user
//! deactivated concurrently can never end up owning a fresh or changed todo.

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::repository::{Filter, Page, Records};
use crate::service::error::{ServiceError, ServiceResult};
use crate::service::{last_row, TODOS_TABLE, USERS_TABLE};
use crate::storage::{ConnectionSource, Row, RowKey, TableName};
use crate::transaction::{
    step, IsolationLevel, Step, TransactionContext, TransactionController, TransactionError,
    TransactionResult,
};

const MAX_TITLE_LEN: usize = 200;

/// Todo operations.
pub struct TodoService<S: ConnectionSource> {
    controller: TransactionController<S>,
    users: Records,
    todos: Records,
}

impl<S: ConnectionSource> Clone for TodoService<S> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            users: self.users.clone(),
            todos: self.todos.clone(),
        }
    }
}

impl<S: ConnectionSource> TodoService<S> {
    pub fn new(controller: TransactionController<S>) -> ServiceResult<Self> {
        let table = |name: &str| {
            TableName::new(name).map_err(|e| ServiceError::invalid(format!("table {}: {}", name, e)))
        };
        Ok(Self {
            controller,
            users: Records::new(table(USERS_TABLE)?),
            todos: Records::new(table(TODOS_TABLE)?),
        })
    }

    /// Create a todo for an existing user.
    pub fn create(&self, owner: &RowKey, title: &str) -> ServiceResult<Row> {
        let title = validate_title(title)?;
        let (users, todos) = (&self.users, &self.todos);
        let title = title.as_str();

        let results = self.controller.execute_dependent_with_retry(
            Some(IsolationLevel::Serializable),
            || {
                let steps: Vec<Step<'_, S::Conn, Option<Row>>> = vec![
                    step(move |ctx| {
                        users.find_one(ctx, owner)?;
                        Ok(None)
                    }),
                    step(move |ctx| {
                        let row = todos.insert(
                            ctx,
                            json!({
                                "owner_id": owner.as_str(),
                                "title": title,
                                "done": false,
                                "completed_at": null,
                            }),
                        )?;
                        Ok(Some(row))
                    }),
                ];
                steps
            },
        )?;

        let todo = last_row(results)?;
        info!(owner = %owner, todo = %todo.key, "todo created");
        Ok(todo)
    }

    /// Fetch one of the owner's todos.
    pub fn get(&self, owner: &RowKey, key: &RowKey) -> ServiceResult<Row> {
        Ok(self
            .controller
            .execute(Some(IsolationLevel::ReadCommitted), |ctx| {
                self.owned_todo(ctx, owner, key)
            })?)
    }

    /// Change a todo's title.
    pub fn update(&self, owner: &RowKey, key: &RowKey, title: &str) -> ServiceResult<Row> {
        let title = validate_title(title)?;
        self.mutate_owned(owner, key, |todos, ctx, todo| {
            todos.update(ctx, &todo.key, json!({ "title": title }))
        })
    }

    /// Mark a todo done. Completing a completed todo keeps its original time.
    pub fn complete(&self, owner: &RowKey, key: &RowKey) -> ServiceResult<Row> {
        self.mutate_owned(owner, key, |todos, ctx, todo| {
            if todo.get("done") == Some(&json!(true)) {
                return Ok(todo);
            }
            todos.update(
                ctx,
                &todo.key,
                json!({ "done": true, "completed_at": Utc::now().to_rfc3339() }),
            )
        })
    }

    /// Soft-delete a todo.
    pub fn delete(&self, owner: &RowKey, key: &RowKey) -> ServiceResult<Row> {
        let deleted = self.mutate_owned(owner, key, |todos, ctx, todo| {
            todos.soft_delete(ctx, &todo.key)
        })?;
        info!(owner = %owner, todo = %key, "todo deleted");
        Ok(deleted)
    }

    /// The owner's live todos in creation order.
    pub fn list(&self, owner: &RowKey, page: Page) -> ServiceResult<Vec<Row>> {
        Ok(self
            .controller
            .execute(Some(IsolationLevel::ReadCommitted), |ctx| {
                self.users.find_one(ctx, owner)?;
                self.todos
                    .find_many(ctx, &Filter::new().eq("owner_id", owner.as_str()), page)
            })?)
    }

    /// `[find_owner, mutate_todo]` as one retried serializable unit of work.
    fn mutate_owned<F>(&self, owner: &RowKey, key: &RowKey, mutate: F) -> ServiceResult<Row>
    where
        F: Fn(&Records, &mut TransactionContext<S::Conn>, Row) -> TransactionResult<Row>,
    {
        let mutate = &mutate;
        let results = self.controller.execute_dependent_with_retry(
            Some(IsolationLevel::Serializable),
            || {
                let steps: Vec<Step<'_, S::Conn, Option<Row>>> = vec![
                    step(move |ctx| {
                        self.users.find_one(ctx, owner)?;
                        Ok(None)
                    }),
                    step(move |ctx| {
                        let todo = self.owned_todo(ctx, owner, key)?;
                        mutate(&self.todos, ctx, todo).map(Some)
                    }),
                ];
                steps
            },
        )?;
        last_row(results)
    }

    fn owned_todo(
        &self,
        ctx: &TransactionContext<S::Conn>,
        owner: &RowKey,
        key: &RowKey,
    ) -> TransactionResult<Row> {
        let todo = self.todos.find_one(ctx, key)?;
        if todo.get_str("owner_id") != Some(owner.as_str()) {
            return Err(TransactionError::validation(format!(
                "todo {} does not belong to user {}",
                key, owner
            )));
        }
        Ok(todo)
    }
}

fn validate_title(title: &str) -> ServiceResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ServiceError::invalid("title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ServiceError::invalid(format!(
            "title longer than {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{install_tables, UserService};
    use crate::storage::MemoryStore;

    fn services() -> (MemoryStore, UserService<MemoryStore>, TodoService<MemoryStore>) {
        let store = MemoryStore::default();
        install_tables(&store).unwrap();
        let controller = TransactionController::new(store.clone());
        let users = UserService::new(controller.clone()).unwrap();
        let todos = TodoService::new(controller).unwrap();
        (store, users, todos)
    }

    #[test]
    fn test_create_and_list() {
        let (_store, users, todos) = services();
        let dana = users.register("dana@example.com", "Dana").unwrap();

        let first = todos.create(&dana.key, "buy milk").unwrap();
        todos.create(&dana.key, "walk dog").unwrap();
        assert_eq!(first.get("done"), Some(&json!(false)));

        let listed = todos.list(&dana.key, Page::default()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(todos.list(&dana.key, Page::first(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_create_for_missing_owner_writes_nothing() {
        let (store, _users, todos) = services();
        let ghost = RowKey::new("ghost").unwrap();

        let err = todos.create(&ghost, "orphan").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { ref table, .. } if table == "users"));
        let table = TableName::new(TODOS_TABLE).unwrap();
        assert!(store.committed_rows(&table).unwrap().is_empty());
    }

    #[test]
    fn test_complete_is_idempotent() {
        let (_store, users, todos) = services();
        let erin = users.register("erin@example.com", "Erin").unwrap();
        let todo = todos.create(&erin.key, "file taxes").unwrap();

        let done = todos.complete(&erin.key, &todo.key).unwrap();
        assert_eq!(done.get("done"), Some(&json!(true)));
        let completed_at = done.get_str("completed_at").map(str::to_string);
        assert!(completed_at.is_some());

        let again = todos.complete(&erin.key, &todo.key).unwrap();
        assert_eq!(again.get_str("completed_at").map(str::to_string), completed_at);
        assert_eq!(again.version, done.version);
    }

    #[test]
    fn test_other_owner_cannot_touch_todo() {
        let (_store, users, todos) = services();
        let frank = users.register("frank@example.com", "Frank").unwrap();
        let grace = users.register("grace@example.com", "Grace").unwrap();
        let todo = todos.create(&frank.key, "secret plan").unwrap();

        let err = todos.update(&grace.key, &todo.key, "stolen").unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(ref m) if m.contains("does not belong")));
        assert!(matches!(
            todos.get(&grace.key, &todo.key),
            Err(ServiceError::Invalid(_))
        ));
        assert_eq!(
            todos.get(&frank.key, &todo.key).unwrap().get_str("title"),
            Some("secret plan")
        );
    }

    #[test]
    fn test_delete_hides_todo() {
        let (_store, users, todos) = services();
        let heidi = users.register("heidi@example.com", "Heidi").unwrap();
        let todo = todos.create(&heidi.key, "temporary").unwrap();

        let deleted = todos.delete(&heidi.key, &todo.key).unwrap();
        assert!(deleted.is_deleted());
        assert!(todos.list(&heidi.key, Page::default()).unwrap().is_empty());
        assert!(matches!(
            todos.delete(&heidi.key, &todo.key),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_deactivated_owner_blocks_writes() {
        let (_store, users, todos) = services();
        let ivan = users.register("ivan@example.com", "Ivan").unwrap();
        let todo = todos.create(&ivan.key, "one").unwrap();
        assert_eq!(users.deactivate(&ivan.key).unwrap(), 1);

        assert!(matches!(
            todos.create(&ivan.key, "two"),
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            todos.complete(&ivan.key, &todo.key),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_title_validation() {
        let (_store, users, todos) = services();
        let judy = users.register("judy@example.com", "Judy").unwrap();
        assert!(matches!(todos.create(&judy.key, "   "), Err(ServiceError::Invalid(_))));
        let long = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(todos.create(&judy.key, &long), Err(ServiceError::Invalid(_))));
    }
}
