use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{SubTodoId, UserId};
use super::todo::{ValidationError, validate_content};

/// An item that todos point at through their `sub_todos` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubTodo {
    pub id: SubTodoId,
    pub content: String,
    pub complete: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewSubTodoRequest {
    pub content: Option<String>,
    pub complete: Option<bool>,
    pub created_by: Option<UserId>,
}

impl SubTodo {
    pub fn create(req: NewSubTodoRequest, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let content = validate_content(req.content.as_deref())?.to_owned();

        Ok(Self {
            id: SubTodoId::new(),
            content,
            complete: req.complete.unwrap_or(false),
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
        })
    }
}
