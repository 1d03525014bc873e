//! User registration and lookup.

use serde_json::json;
use tracing::info;

use crate::repository::{Filter, Page, Records};
use crate::service::error::{ServiceError, ServiceResult};
use crate::service::{last_row, TODOS_TABLE, USERS_TABLE};
use crate::storage::{ConnectionSource, Row, RowKey, TableName};
use crate::transaction::{step, IsolationLevel, Step, TransactionController, TransactionError};

/// User operations.
pub struct UserService<S: ConnectionSource> {
    controller: TransactionController<S>,
    users: Records,
    todos: Records,
}

impl<S: ConnectionSource> Clone for UserService<S> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            users: self.users.clone(),
            todos: self.todos.clone(),
        }
    }
}

impl<S: ConnectionSource> UserService<S> {
    pub fn new(controller: TransactionController<S>) -> ServiceResult<Self> {
        Ok(Self {
            controller,
            users: Records::new(table(USERS_TABLE)?),
            todos: Records::new(table(TODOS_TABLE)?),
        })
    }

    pub fn controller(&self) -> &TransactionController<S> {
        &self.controller
    }

    /// Register a user with a unique email.
    ///
    /// The uniqueness check and the insert run as one serializable unit of
    /// work, so two concurrent registrations of the same email cannot both
    /// pass the check. Conflicts are retried; a taken email is not.
    pub fn register(&self, email: &str, name: &str) -> ServiceResult<Row> {
        let email = normalize_email(email)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::invalid("name must not be empty"));
        }

        let users = &self.users;
        let email = email.as_str();
        let results = self.controller.execute_dependent_with_retry(
            Some(IsolationLevel::Serializable),
            || {
                let steps: Vec<Step<'_, S::Conn, Option<Row>>> = vec![
                    step(move |ctx| {
                        let taken = users.count(ctx, &Filter::new().eq("email", email))?;
                        if taken > 0 {
                            return Err(TransactionError::validation(format!(
                                "email {} is already registered",
                                email
                            )));
                        }
                        Ok(None)
                    }),
                    step(move |ctx| {
                        let row = users.insert(ctx, json!({ "email": email, "name": name }))?;
                        Ok(Some(row))
                    }),
                ];
                steps
            },
        )?;

        let user = last_row(results)?;
        info!(user = %user.key, "user registered");
        Ok(user)
    }

    /// Fetch a live user.
    pub fn get(&self, key: &RowKey) -> ServiceResult<Row> {
        Ok(self
            .controller
            .execute(Some(IsolationLevel::ReadCommitted), |ctx| {
                self.users.find_one(ctx, key)
            })?)
    }

    pub fn find_by_email(&self, email: &str) -> ServiceResult<Option<Row>> {
        let email = normalize_email(email)?;
        let mut found = self
            .controller
            .execute(Some(IsolationLevel::ReadCommitted), |ctx| {
                self.users
                    .find_many(ctx, &Filter::new().eq("email", email.as_str()), Page::first(1))
            })?;
        Ok(found.pop())
    }

    /// Soft-delete a user together with their live todos. Returns how many
    /// todos were closed.
    pub fn deactivate(&self, key: &RowKey) -> ServiceResult<usize> {
        let closed = self
            .controller
            .execute_with_retry(Some(IsolationLevel::Serializable), |ctx| {
                self.users.find_one(ctx, key)?;
                let owned = self.todos.find_many(
                    ctx,
                    &Filter::new().eq("owner_id", key.as_str()),
                    Page::first(usize::MAX),
                )?;
                for todo in &owned {
                    self.todos.soft_delete(ctx, &todo.key)?;
                }
                self.users.soft_delete(ctx, key)?;
                Ok(owned.len())
            })?;
        info!(user = %key, todos = closed, "user deactivated");
        Ok(closed)
    }
}

fn table(name: &str) -> ServiceResult<TableName> {
    TableName::new(name).map_err(|e| ServiceError::invalid(format!("table {}: {}", name, e)))
}

/// Trim and lowercase an email, rejecting obviously malformed ones.
fn normalize_email(email: &str) -> ServiceResult<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(ServiceError::invalid(format!("'{}' is not an email address", email))),
    }
}
