pub mod auth;
pub mod error;

pub use auth::{Identity, UserId, UserRole};
pub use error::AppError;
