// ABOUTME: Key/value storage capability consumed by persisters, plus change notifications.
// ABOUTME: Mirrors the getItem/setItem/removeItem surface of browser storage areas.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the change-notification channel shared by handles of one store.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors a storage backend can report.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("storage quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Identity of one underlying store. Handles cloned from the same store share
/// an area; change events from any other area are ignored by persisters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageArea(u64);

impl StorageArea {
    /// Allocate a process-unique area identity.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Identity of one storage handle, the analogue of a browser tab. Clones of
/// a handle keep its origin; `new_handle` on a backend mints a fresh one.
/// Persisters ignore change events carrying their own handle's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageOrigin(u64);

impl StorageOrigin {
    /// Allocate a process-unique origin.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A change to one key of a storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub area: StorageArea,
    /// Handle that made the change.
    pub origin: StorageOrigin,
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A synchronous string key/value store.
pub trait Storage: Send + Sync {
    /// Read the raw value for `key`, `None` when absent.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete `key`. Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    /// All keys currently stored, in unspecified order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// The area this handle writes to.
    fn area(&self) -> StorageArea;

    /// The origin stamped on events published by writes through this handle.
    fn origin(&self) -> StorageOrigin;

    /// Subscribe to change events for this area. Backends that cannot observe
    /// changes return `None`.
    fn subscribe(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        None
    }
}

/// Broadcast hub shared by every handle of one store. Backends hold one and
/// publish after each successful write or removal.
#[derive(Debug, Clone)]
pub struct StorageEvents {
    area: StorageArea,
    tx: broadcast::Sender<StorageEvent>,
}

impl StorageEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            area: StorageArea::unique(),
            tx,
        }
    }

    pub fn area(&self) -> StorageArea {
        self.area
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }

    /// Notify subscribers that `origin` changed `key` from `old_value` to
    /// `new_value`.
    pub fn publish(
        &self,
        origin: StorageOrigin,
        key: &str,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        // No active subscribers is fine
        let _ = self.tx.send(StorageEvent {
            area: self.area,
            origin,
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl Default for StorageEvents {
    fn default() -> Self {
        Self::new()
    }
}
