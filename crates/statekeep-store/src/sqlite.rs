// ABOUTME: SQLite-backed storage area keeping every key in a single key/value table.
// ABOUTME: Suited to many small states in one file; upserts per key and publishes change events.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use statekeep_core::storage::{
    Storage, StorageArea, StorageError, StorageEvent, StorageEvents, StorageOrigin,
};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors that can occur while opening or querying the SQLite store.
#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<SqliteError> for StorageError {
    fn from(err: SqliteError) -> Self {
        StorageError::Sqlite(err.to_string())
    }
}

struct SqliteInner {
    conn: Mutex<Connection>,
    events: StorageEvents,
}

/// A storage area in a SQLite database. Clones share the connection, the
/// change channel, and the origin.
#[derive(Clone)]
pub struct SqliteStorage {
    inner: Arc<SqliteInner>,
    origin: StorageOrigin,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    /// Runs migrations to ensure the schema is up to date.
    pub fn open(path: &Path) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// A private, non-persistent database.
    pub fn in_memory() -> Result<Self, SqliteError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SqliteError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(conn),
                events: StorageEvents::new(),
            }),
            origin: StorageOrigin::unique(),
        })
    }

    /// Another handle on the same connection with its own origin.
    pub fn new_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: StorageOrigin::unique(),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.inner.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn select(conn: &Connection, key: &str) -> Result<Option<String>, SqliteError> {
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}

impl Storage for SqliteStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn()?;
        Ok(Self::select(&conn, key)?)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old = {
            let conn = self.conn()?;
            let old = Self::select(&conn, key)?;
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(SqliteError::from)?;
            old
        };
        self.inner
            .events
            .publish(self.origin, key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let old = {
            let conn = self.conn()?;
            let old = Self::select(&conn, key)?;
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(SqliteError::from)?;
            old
        };
        if let Some(old) = old {
            self.inner
                .events
                .publish(self.origin, key, Some(old), None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv ORDER BY key")
            .map_err(SqliteError::from)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(SqliteError::from)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(SqliteError::from)?);
        }
        Ok(keys)
    }

    fn area(&self) -> StorageArea {
        self.inner.events.area()
    }

    fn origin(&self) -> StorageOrigin {
        self.origin
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        Some(self.inner.events.subscribe())
    }
}
