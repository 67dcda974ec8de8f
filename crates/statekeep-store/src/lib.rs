// ABOUTME: Storage backends for statekeep persisters.
// ABOUTME: Provides an in-memory store with optional quota, a file-per-key directory store, and a SQLite store.

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use sqlite::{SqliteError, SqliteStorage};
