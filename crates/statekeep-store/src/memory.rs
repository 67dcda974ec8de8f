// ABOUTME: In-memory storage area, the analogue of a browser session store.
// ABOUTME: Clones share one map and one change channel; an optional byte quota rejects oversized writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use statekeep_core::storage::{
    Storage, StorageArea, StorageError, StorageEvent, StorageEvents, StorageOrigin,
};
use tokio::sync::broadcast;

struct MemoryInner {
    items: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
    events: StorageEvents,
}

/// A process-local key/value store. Clones share the map, the change channel,
/// and the origin; [`MemoryStorage::new_handle`] opens another "tab" whose
/// writes are observed by persisters on this one.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
    origin: StorageOrigin,
}

impl MemoryStorage {
    /// An unbounded store.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A store that refuses writes once keys plus values would exceed
    /// `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self::build(Some(quota_bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                items: Mutex::new(HashMap::new()),
                quota,
                events: StorageEvents::new(),
            }),
            origin: StorageOrigin::unique(),
        }
    }

    /// Another handle on the same area with its own origin.
    pub fn new_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: StorageOrigin::unique(),
        }
    }

    /// Bytes currently used by keys and values.
    pub fn used_bytes(&self) -> Result<usize, StorageError> {
        Ok(self.items()?.iter().map(|(k, v)| k.len() + v.len()).sum())
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.items()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.items()?.is_empty())
    }

    /// Remove every key, notifying subscribers once per removed key.
    pub fn clear(&self) -> Result<(), StorageError> {
        let drained: Vec<(String, String)> = self.items()?.drain().collect();
        for (key, old) in drained {
            self.inner
                .events
                .publish(self.origin, &key, Some(old), None);
        }
        Ok(())
    }

    fn items(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.inner.items.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old = {
            let mut items = self.items()?;
            if let Some(quota) = self.inner.quota {
                let used: usize = items.iter().map(|(k, v)| k.len() + v.len()).sum();
                let replaced = items.get(key).map_or(0, |old| key.len() + old.len());
                let needed = used - replaced + key.len() + value.len();
                if needed > quota {
                    return Err(StorageError::QuotaExceeded { needed, quota });
                }
            }
            items.insert(key.to_string(), value.to_string())
        };
        self.inner
            .events
            .publish(self.origin, key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let old = self.items()?.remove(key);
        if let Some(old) = old {
            self.inner
                .events
                .publish(self.origin, key, Some(old), None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items()?.keys().cloned().collect())
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
