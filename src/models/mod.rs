pub mod ids;
pub mod sub_todo;
pub mod todo;
pub mod user;

pub use ids::{SubTodoId, TodoId, UserId};
pub use sub_todo::{NewSubTodoRequest, SubTodo};
pub use todo::{NewTodoRequest, Todo, UpdateTodoRequest, ValidationError};
pub use user::{NewUserRequest, User};
