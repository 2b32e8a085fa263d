//! Persistent store for workflow definitions, executions, cases and query results.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
