//! Resolution of the weak references a todo carries.
//!
//! A todo stores only identifiers for its creator and its sub-todos. Turning
//! them back into records goes through a [`ReferenceResolver`]; identifiers
//! that no longer resolve are reported, not treated as errors.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::repository;
use crate::error::AppError;
use crate::models::{SubTodo, SubTodoId, Todo, User, UserId};

#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, AppError>;

    /// Returns whichever of `ids` exist, in any order.
    async fn find_sub_todos(&self, ids: &[SubTodoId]) -> Result<Vec<SubTodo>, AppError>;
}

/// A todo together with the records its identifiers point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulatedTodo {
    pub todo: Todo,
    pub created_by: Option<User>,
    /// Resolved sub-todos, in the order the todo lists them.
    pub sub_todos: Vec<SubTodo>,
    /// Set when `todo.created_by` names a user that could not be found.
    pub missing_created_by: Option<UserId>,
    pub missing_sub_todos: Vec<SubTodoId>,
}

impl PopulatedTodo {
    pub fn is_complete(&self) -> bool {
        self.missing_created_by.is_none() && self.missing_sub_todos.is_empty()
    }
}

pub async fn resolve_todo(
    todo: &Todo,
    resolver: &dyn ReferenceResolver,
) -> Result<PopulatedTodo, AppError> {
    let (created_by, missing_created_by) = match todo.created_by {
        None => (None, None),
        Some(id) => match resolver.find_user(id).await? {
            Some(user) => (Some(user), None),
            None => {
                warn!("todo {} references missing user {}", todo.id, id);
                (None, Some(id))
            }
        },
    };

    let found: HashMap<SubTodoId, SubTodo> = resolver
        .find_sub_todos(&todo.sub_todos)
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let mut sub_todos = Vec::with_capacity(todo.sub_todos.len());
    let mut missing_sub_todos = Vec::new();
    for id in &todo.sub_todos {
        match found.get(id) {
            Some(sub) => sub_todos.push(sub.clone()),
            None => missing_sub_todos.push(*id),
        }
    }
    if !missing_sub_todos.is_empty() {
        warn!(
            "todo {} references {} missing sub-todos",
            todo.id,
            missing_sub_todos.len()
        );
    }

    Ok(PopulatedTodo {
        todo: todo.clone(),
        created_by,
        sub_todos,
        missing_created_by,
        missing_sub_todos,
    })
}

/// Looks references up in the same SQLite database the todos live in.
#[derive(Clone)]
pub struct SqliteResolver {
    db: SqlitePool,
}

impl SqliteResolver {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ReferenceResolver for SqliteResolver {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, AppError> {
        repository::find_user_by_id(&self.db, id).await
    }

    async fn find_sub_todos(&self, ids: &[SubTodoId]) -> Result<Vec<SubTodo>, AppError> {
        repository::find_sub_todos_by_ids(&self.db, ids).await
    }
}

/// Resolver over records held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResolver {
    users: HashMap<UserId, User>,
    sub_todos: HashMap<SubTodoId, SubTodo>,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users.insert(user.id, user);
        self
    }

    pub fn with_sub_todo(mut self, sub: SubTodo) -> Self {
        self.sub_todos.insert(sub.id, sub);
        self
    }
}

#[async_trait]
impl ReferenceResolver for InMemoryResolver {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, AppError> {
        Ok(self.users.get(&id).cloned())
    }

    async fn find_sub_todos(&self, ids: &[SubTodoId]) -> Result<Vec<SubTodo>, AppError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.sub_todos.get(id).cloned())
            .collect())
    }
}
