use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::ids::{SubTodoId, TodoId, UserId};

/// Reasons a todo (or sub-todo) write is refused before it reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("content is required")]
    MissingContent,

    #[error("content must not be empty")]
    EmptyContent,
}

/// Checks the `content` rule shared by todos and sub-todos.
///
/// Only a zero-length string counts as empty; whitespace is kept as given.
pub fn validate_content(content: Option<&str>) -> Result<&str, ValidationError> {
    match content {
        None => Err(ValidationError::MissingContent),
        Some("") => Err(ValidationError::EmptyContent),
        Some(content) => Ok(content),
    }
}

/// A stored todo item.
///
/// `created_by` and `sub_todos` are weak references: identifiers only, with
/// no ownership of and no integrity check against the referenced records.
/// See [`crate::references`] for turning them back into records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: TodoId,
    pub content: String,
    pub complete: bool,
    pub created_by: Option<UserId>,
    pub sub_todos: Vec<SubTodoId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewTodoRequest {
    pub content: Option<String>,
    pub complete: Option<bool>,
    pub created_by: Option<UserId>,
    pub sub_todos: Option<Vec<SubTodoId>>,
}

impl NewTodoRequest {
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Partial update. Absent fields are left alone.
///
/// `content` and `created_by` are doubly optional so an explicit JSON `null`
/// is not mistaken for an absent field. A `null` creator clears the
/// reference; a `null` content is rejected like a missing one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTodoRequest {
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub content: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_by: Option<Option<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_todos: Option<Vec<SubTodoId>>,
}

impl UpdateTodoRequest {
    /// The new content, if the update sets one.
    pub fn validated_content(&self) -> Result<Option<&str>, ValidationError> {
        match &self.content {
            None => Ok(None),
            Some(content) => validate_content(content.as_deref()).map(Some),
        }
    }
}

/// Next `updated_at` after `previous`: `now`, or one millisecond past
/// `previous` when the clock has not moved beyond it.
pub fn next_stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl Todo {
    /// Builds a new record from a creation request.
    ///
    /// Fails only when `content` is missing or empty. `complete` defaults to
    /// `false`, `sub_todos` to an empty list, and both timestamps to `now`.
    pub fn create(req: NewTodoRequest, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let content = validate_content(req.content.as_deref())?.to_owned();

        Ok(Self {
            id: TodoId::new(),
            content,
            complete: req.complete.unwrap_or(false),
            created_by: req.created_by,
            sub_todos: req.sub_todos.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Merges `update` into this record and stamps `updated_at`.
    ///
    /// Leaves the record untouched when the update is rejected.
    pub fn apply(&mut self, update: UpdateTodoRequest, now: DateTime<Utc>) -> Result<(), ValidationError> {
        update.validated_content()?;

        if let Some(Some(content)) = update.content {
            self.content = content;
        }
        if let Some(complete) = update.complete {
            self.complete = complete;
        }
        if let Some(created_by) = update.created_by {
            self.created_by = created_by;
        }
        if let Some(sub_todos) = update.sub_todos {
            self.sub_todos = sub_todos;
        }
        self.touch(now);
        Ok(())
    }

    pub fn set_complete(&mut self, complete: bool, now: DateTime<Utc>) {
        self.complete = complete;
        self.touch(now);
    }

    pub fn toggle_complete(&mut self, now: DateTime<Utc>) {
        self.set_complete(!self.complete, now);
    }

    pub fn add_sub_todo(&mut self, id: SubTodoId, now: DateTime<Utc>) {
        self.sub_todos.push(id);
        self.touch(now);
    }

    /// Drops every occurrence of `id`. Returns whether anything was removed;
    /// `updated_at` only moves when the list changed.
    pub fn remove_sub_todo(&mut self, id: SubTodoId, now: DateTime<Utc>) -> bool {
        let before = self.sub_todos.len();
        self.sub_todos.retain(|s| *s != id);
        let removed = self.sub_todos.len() != before;
        if removed {
            self.touch(now);
        }
        removed
    }

    /// Stamps `updated_at`. The stamp always moves forward, even when the
    /// clock has not advanced since the previous write.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = next_stamp(self.updated_at, now);
    }
}
