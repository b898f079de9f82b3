//! Persistence layer modules.

pub mod contribution_repo;
pub mod cost_repo;
pub mod db;
pub mod event_repo;
pub mod retention;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
