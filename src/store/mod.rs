//! Bridge user persistence
//!
//! - `SqliteUserStore`: production store (sqlx, SQLite)
//! - `MemoryUserStore`: in-memory store for tests

pub mod mock;
pub mod sqlite;
pub mod traits;

pub use mock::MemoryUserStore;
pub use sqlite::SqliteUserStore;
pub use traits::{SessionState, StoreError, StoreResult, UserRow, UserStore};
