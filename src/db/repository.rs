use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::todo::{next_stamp, validate_content};
use crate::models::*;

const TODO_COLUMNS: &str =
    "id, content, complete, created_by, sub_todos, created_at, updated_at";
const SUB_TODO_COLUMNS: &str = "id, content, complete, created_by, created_at, updated_at";

/// SQLite's default cap on bound parameters per statement.
const MAX_BIND_VARIABLES: usize = 32_766;

/// Storage shape of a todo: the sub-todo list is kept as a JSON array column.
#[derive(Debug, FromRow)]
struct TodoRow {
    id: TodoId,
    content: String,
    complete: bool,
    created_by: Option<UserId>,
    sub_todos: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<TodoRow> for Todo {
    type Error = serde_json::Error;

    fn try_from(row: TodoRow) -> Result<Self, Self::Error> {
        Ok(Todo {
            id: row.id,
            content: row.content,
            complete: row.complete,
            created_by: row.created_by,
            sub_todos: serde_json::from_str(&row.sub_todos)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn insert_todo(db: &SqlitePool, req: NewTodoRequest) -> Result<Todo, AppError> {
    let todo = Todo::create(req, Utc::now())?;
    insert_todo_row(db, &todo).await?;

    info!("created todo {}", todo.id);
    Ok(todo)
}

pub async fn find_todo_by_id(db: &SqlitePool, id: TodoId) -> Result<Option<Todo>, AppError> {
    let row = sqlx::query_as::<_, TodoRow>(&format!(
        "SELECT {TODO_COLUMNS} FROM todos WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;

    Ok(row.map(Todo::try_from).transpose()?)
}

/// All todos, most recently written first.
pub async fn fetch_todos(db: &SqlitePool) -> Result<Vec<Todo>, AppError> {
    let rows = sqlx::query_as::<_, TodoRow>(&format!(
        "SELECT {TODO_COLUMNS} FROM todos ORDER BY updated_at DESC"
    ))
    .fetch_all(db)
    .await?;

    debug!("fetched {} todos", rows.len());
    rows.into_iter()
        .map(|row| Todo::try_from(row).map_err(AppError::from))
        .collect()
}

pub async fn count_todos(db: &SqlitePool) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM todos")
        .fetch_one(db)
        .await?;
    Ok(count)
}

/// Applies `req` to the stored todo. Returns `Ok(None)` when no todo has `id`.
///
/// Only the columns named in `req` are written, so concurrent updates to
/// different fields do not overwrite each other.
pub async fn update_todo(
    db: &SqlitePool,
    id: TodoId,
    req: UpdateTodoRequest,
) -> Result<Option<Todo>, AppError> {
    let content = req.validated_content()?.map(str::to_owned);

    let previous = match sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT updated_at FROM todos WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    {
        Some(t) => t,
        None => return Ok(None),
    };
    let stamp = next_stamp(previous, Utc::now());

    let mut query = QueryBuilder::<Sqlite>::new("UPDATE todos SET ");
    let mut set = query.separated(", ");
    if let Some(content) = content {
        set.push("content = ").push_bind_unseparated(content);
    }
    if let Some(complete) = req.complete {
        set.push("complete = ").push_bind_unseparated(complete);
    }
    if let Some(created_by) = req.created_by {
        set.push("created_by = ").push_bind_unseparated(created_by);
    }
    if let Some(sub_todos) = &req.sub_todos {
        set.push("sub_todos = ")
            .push_bind_unseparated(serde_json::to_string(sub_todos)?);
    }
    set.push("updated_at = ").push_bind_unseparated(stamp);
    query.push(" WHERE id = ").push_bind(id);
    query.push(format!(" RETURNING {TODO_COLUMNS}"));

    let row = query.build_query_as::<TodoRow>().fetch_optional(db).await?;
    let Some(row) = row else {
        return Ok(None);
    };

    info!("updated todo {}", id);
    Ok(Some(Todo::try_from(row)?))
}

/// Persists a record mutated in memory.
///
/// A todo not yet stored is inserted with its timestamps as they are. A
/// stored one has `updated_at` stamped before the write; its stored
/// `created_at` is never overwritten.
pub async fn save_todo(db: &SqlitePool, todo: &mut Todo) -> Result<(), AppError> {
    validate_content(Some(&todo.content))?;

    let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM todos WHERE id = ?")
        .bind(todo.id)
        .fetch_one(db)
        .await?
        > 0;

    if exists {
        todo.touch(Utc::now());
        update_todo_row(db, todo).await?;
        info!("saved todo {}", todo.id);
    } else {
        insert_todo_row(db, todo).await?;
        info!("inserted todo {}", todo.id);
    }
    Ok(())
}

/// Removes the todo. Referenced users and sub-todos are left alone.
pub async fn delete_todo(db: &SqlitePool, id: TodoId) -> Result<bool, AppError> {
    let result = sqlx::query("DELETE FROM todos WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?
        .rows_affected();

    if result > 0 {
        info!("deleted todo {}", id);
    }
    Ok(result > 0)
}

async fn insert_todo_row(db: &SqlitePool, todo: &Todo) -> Result<(), AppError> {
    let sub_todos = serde_json::to_string(&todo.sub_todos)?;

    sqlx::query(&format!(
        "INSERT INTO todos ({TODO_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(todo.id)
    .bind(&todo.content)
    .bind(todo.complete)
    .bind(todo.created_by)
    .bind(sub_todos)
    .bind(todo.created_at)
    .bind(todo.updated_at)
    .execute(db)
    .await?;
    Ok(())
}

async fn update_todo_row(db: &SqlitePool, todo: &Todo) -> Result<(), AppError> {
    let sub_todos = serde_json::to_string(&todo.sub_todos)?;

    let affected = sqlx::query(
        "UPDATE todos SET content = ?, complete = ?, created_by = ?, sub_todos = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&todo.content)
    .bind(todo.complete)
    .bind(todo.created_by)
    .bind(sub_todos)
    .bind(todo.updated_at)
    .bind(todo.id)
    .execute(db)
    .await?
    .rows_affected();

    if affected == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

pub async fn insert_user(db: &SqlitePool, req: NewUserRequest) -> Result<User, AppError> {
    let user = User::create(req, Utc::now());

    sqlx::query("INSERT INTO users (id, username, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(user.id)
        .bind(&user.username)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(db)
        .await?;

    info!("created user {}", user.id);
    Ok(user)
}

pub async fn find_user_by_id(db: &SqlitePool, id: UserId) -> Result<Option<User>, AppError> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, username, created_at, updated_at FROM users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(user)
}

pub async fn insert_sub_todo(db: &SqlitePool, req: NewSubTodoRequest) -> Result<SubTodo, AppError> {
    let sub = SubTodo::create(req, Utc::now())?;

    sqlx::query(&format!(
        "INSERT INTO sub_todos ({SUB_TODO_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
    ))
    .bind(sub.id)
    .bind(&sub.content)
    .bind(sub.complete)
    .bind(sub.created_by)
    .bind(sub.created_at)
    .bind(sub.updated_at)
    .execute(db)
    .await?;

    info!("created sub-todo {}", sub.id);
    Ok(sub)
}

/// Loads the sub-todos whose ids appear in `ids`, in no particular order.
/// Unknown ids are skipped and each match is returned once.
pub async fn find_sub_todos_by_ids(
    db: &SqlitePool,
    ids: &[SubTodoId],
) -> Result<Vec<SubTodo>, AppError> {
    let mut unique = ids.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let mut subs = Vec::new();
    for chunk in unique.chunks(MAX_BIND_VARIABLES) {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SUB_TODO_COLUMNS} FROM sub_todos WHERE id IN ("
        ));
        let mut separated = query.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        subs.extend(query.build_query_as::<SubTodo>().fetch_all(db).await?);
    }
    Ok(subs)
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test db");

        crate::db::migrate(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    #[tokio::test]
    async fn test_insert_and_fetch_todo() {
        let pool = setup_test_db().await;

        let todo = insert_todo(&pool, NewTodoRequest::with_content("buy milk"))
            .await
            .expect("Failed to insert todo");

        assert_eq!(todo.content, "buy milk");
        assert!(!todo.complete);
        assert!(todo.sub_todos.is_empty());
        assert_eq!(todo.created_at, todo.updated_at);

        let todos = fetch_todos(&pool).await.expect("Failed to fetch todos");
        assert_eq!(todos, vec![todo]);
    }

    #[tokio::test]
    async fn test_insert_rejects_missing_content() {
        let pool = setup_test_db().await;

        let err = insert_todo(&pool, NewTodoRequest::default())
            .await
            .expect_err("insert without content should fail");
        assert!(matches!(err, AppError::Validation(ValidationError::MissingContent)));

        assert_eq!(count_todos(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stored_record_round_trips() {
        let pool = setup_test_db().await;

        let req = NewTodoRequest {
            content: Some("pack bags".to_string()),
            complete: Some(true),
            created_by: Some(UserId::new()),
            sub_todos: Some(vec![SubTodoId::new(), SubTodoId::new()]),
        };
        let todo = insert_todo(&pool, req).await.expect("Failed to insert todo");

        let loaded = find_todo_by_id(&pool, todo.id)
            .await
            .expect("Failed to load todo")
            .expect("Todo not found");
        assert_eq!(loaded, todo);
    }

    #[tokio::test]
    async fn test_update_todo() {
        let pool = setup_test_db().await;
        let todo = insert_todo(&pool, NewTodoRequest::with_content("draft"))
            .await
            .expect("Failed to insert todo");

        let update_req = UpdateTodoRequest {
            content: Some(Some("final".to_string())),
            complete: Some(true),
            ..UpdateTodoRequest::default()
        };
        let updated = update_todo(&pool, todo.id, update_req)
            .await
            .expect("Failed to update todo")
            .expect("Todo not found");

        assert_eq!(updated.content, "final");
        assert!(updated.complete);
        assert_eq!(updated.created_at, todo.created_at);
        assert!(updated.updated_at > todo.updated_at);

        let stored = find_todo_by_id(&pool, todo.id).await.unwrap().unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_update_rejects_empty_content() {
        let pool = setup_test_db().await;
        let todo = insert_todo(&pool, NewTodoRequest::with_content("keep"))
            .await
            .unwrap();

        let err = update_todo(
            &pool,
            todo.id,
            UpdateTodoRequest {
                content: Some(Some(String::new())),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .expect_err("empty content should be rejected");
        assert!(matches!(err, AppError::Validation(ValidationError::EmptyContent)));

        let stored = find_todo_by_id(&pool, todo.id).await.unwrap().unwrap();
        assert_eq!(stored, todo);
    }

    #[tokio::test]
    async fn test_update_rejects_null_content() {
        let pool = setup_test_db().await;
        let todo = insert_todo(&pool, NewTodoRequest::with_content("x"))
            .await
            .unwrap();

        let req: UpdateTodoRequest =
            serde_json::from_value(serde_json::json!({ "content": null })).unwrap();
        let err = update_todo(&pool, todo.id, req)
            .await
            .expect_err("null content should be rejected");
        assert!(matches!(err, AppError::Validation(ValidationError::MissingContent)));

        let stored = find_todo_by_id(&pool, todo.id).await.unwrap().unwrap();
        assert_eq!(stored, todo);
    }

    #[tokio::test]
    async fn test_update_writes_only_given_fields() {
        let pool = setup_test_db().await;
        let user = UserId::new();
        let sub = SubTodoId::new();
        let todo = insert_todo(
            &pool,
            NewTodoRequest {
                content: Some("original".to_string()),
                created_by: Some(user),
                sub_todos: Some(vec![sub]),
                ..NewTodoRequest::default()
            },
        )
        .await
        .unwrap();

        let updated = update_todo(
            &pool,
            todo.id,
            UpdateTodoRequest {
                complete: Some(true),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert!(updated.complete);
        assert_eq!(updated.content, "original");
        assert_eq!(updated.created_by, Some(user));
        assert_eq!(updated.sub_todos, vec![sub]);
        assert_eq!(updated.created_at, todo.created_at);

        let cleared = update_todo(
            &pool,
            todo.id,
            UpdateTodoRequest {
                created_by: Some(None),
                sub_todos: Some(Vec::new()),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(cleared.created_by, None);
        assert!(cleared.sub_todos.is_empty());
        assert!(cleared.complete);
        assert!(cleared.updated_at > updated.updated_at);
    }

    #[tokio::test]
    async fn test_save_rejects_emptied_content() {
        let pool = setup_test_db().await;
        let mut todo = insert_todo(&pool, NewTodoRequest::with_content("stays"))
            .await
            .unwrap();
        let stored_before = find_todo_by_id(&pool, todo.id).await.unwrap().unwrap();

        todo.content.clear();
        todo.complete = true;
        let err = save_todo(&pool, &mut todo)
            .await
            .expect_err("empty content should not be saved");
        assert!(matches!(err, AppError::Validation(ValidationError::EmptyContent)));

        let stored = find_todo_by_id(&pool, todo.id).await.unwrap().unwrap();
        assert_eq!(stored, stored_before);
    }

    #[tokio::test]
    async fn test_find_sub_todos_beyond_bind_limit() {
        let pool = setup_test_db().await;
        let mut expected = Vec::new();
        for content in ["first", "last"] {
            expected.push(
                insert_sub_todo(
                    &pool,
                    NewSubTodoRequest {
                        content: Some(content.to_string()),
                        ..NewSubTodoRequest::default()
                    },
                )
                .await
                .unwrap(),
            );
        }

        let mut ids = vec![expected[0].id];
        ids.extend((0..40_000).map(|_| SubTodoId::new()));
        ids.push(expected[1].id);
        ids.push(expected[0].id);

        let mut found = find_sub_todos_by_ids(&pool, &ids).await.unwrap();
        found.sort_by_key(|s| s.id);
        expected.sort_by_key(|s| s.id);
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_update_missing_todo_returns_none() {
        let pool = setup_test_db().await;
        let result = update_todo(&pool, TodoId::new(), UpdateTodoRequest::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_save_inserts_then_updates() {
        let pool = setup_test_db().await;
        let mut todo = Todo::create(NewTodoRequest::with_content("offline"), Utc::now()).unwrap();
        let created_at = todo.created_at;

        save_todo(&pool, &mut todo).await.expect("Failed to insert via save");
        assert_eq!(todo.updated_at, created_at);

        let first_write = todo.updated_at;
        todo.add_sub_todo(SubTodoId::new(), first_write);
        todo.set_complete(true, first_write);
        save_todo(&pool, &mut todo).await.expect("Failed to update via save");

        let stored = find_todo_by_id(&pool, todo.id).await.unwrap().unwrap();
        assert_eq!(stored, todo);
        assert_eq!(stored.created_at, created_at);
        assert!(stored.updated_at > first_write);
        assert_eq!(stored.sub_todos.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_last_write() {
        let pool = setup_test_db().await;
        let first = insert_todo(&pool, NewTodoRequest::with_content("first")).await.unwrap();
        let second = insert_todo(&pool, NewTodoRequest::with_content("second")).await.unwrap();

        update_todo(
            &pool,
            first.id,
            UpdateTodoRequest {
                complete: Some(true),
                ..UpdateTodoRequest::default()
            },
        )
        .await
        .unwrap();

        let todos = fetch_todos(&pool).await.unwrap();
        let ids: Vec<TodoId> = todos.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_delete_todo_leaves_references() {
        let pool = setup_test_db().await;
        let user = insert_user(&pool, NewUserRequest { username: "hana".to_string() })
            .await
            .unwrap();
        let sub = insert_sub_todo(
            &pool,
            NewSubTodoRequest {
                content: Some("step".to_string()),
                ..NewSubTodoRequest::default()
            },
        )
        .await
        .unwrap();
        let todo = insert_todo(
            &pool,
            NewTodoRequest {
                content: Some("task".to_string()),
                created_by: Some(user.id),
                sub_todos: Some(vec![sub.id]),
                ..NewTodoRequest::default()
            },
        )
        .await
        .unwrap();

        assert!(delete_todo(&pool, todo.id).await.unwrap());
        assert!(!delete_todo(&pool, todo.id).await.unwrap());

        assert!(find_todo_by_id(&pool, todo.id).await.unwrap().is_none());
        assert_eq!(find_user_by_id(&pool, user.id).await.unwrap(), Some(user));
        assert_eq!(find_sub_todos_by_ids(&pool, &[sub.id]).await.unwrap(), vec![sub]);
    }

    #[tokio::test]
    async fn test_find_sub_todos_skips_unknown_ids() {
        let pool = setup_test_db().await;
        let sub = insert_sub_todo(
            &pool,
            NewSubTodoRequest {
                content: Some("one".to_string()),
                ..NewSubTodoRequest::default()
            },
        )
        .await
        .unwrap();

        let found = find_sub_todos_by_ids(&pool, &[SubTodoId::new(), sub.id])
            .await
            .unwrap();
        assert_eq!(found, vec![sub]);
        assert!(find_sub_todos_by_ids(&pool, &[]).await.unwrap().is_empty());
    }
}
