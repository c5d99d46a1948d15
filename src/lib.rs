//! Todo records with weak references to users and sub-todos, stored in SQLite.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod references;

pub use config::Config;
pub use error::AppError;
pub use models::{
    NewSubTodoRequest, NewTodoRequest, NewUserRequest, SubTodo, SubTodoId, Todo, TodoId,
    UpdateTodoRequest, User, UserId, ValidationError,
};
pub use references::{InMemoryResolver, PopulatedTodo, ReferenceResolver, SqliteResolver, resolve_todo};
