// ABOUTME: Test utilities for statekeep, including a scriptable in-memory storage stub.
// ABOUTME: Used in tests to inject read/write failures and to inspect calls made by persisters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::storage::{
    Storage, StorageArea, StorageError, StorageEvent, StorageEvents, StorageOrigin,
};

/// A call made against a [`StubStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Get(String),
    Set(String, String),
    Remove(String),
}

#[derive(Default)]
struct StubInner {
    items: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<StorageCall>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
    events: StorageEvents,
}

/// An in-memory storage whose failures can be switched on, recording every
/// call. Clones share items, the call log, the storage area, and the origin;
/// [`StubStorage::new_handle`] gives a second "tab" with its own origin.
#[derive(Clone)]
pub struct StubStorage {
    inner: Arc<StubInner>,
    origin: StorageOrigin,
}

impl StubStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            origin: StorageOrigin::unique(),
        }
    }

    /// Another handle on the same items and area, with a distinct origin.
    pub fn new_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: StorageOrigin::unique(),
        }
    }

    /// Place a raw value under `key` without recording a call or an event.
    pub fn seed(&self, key: &str, raw: &str) {
        self.items().insert(key.to_string(), raw.to_string());
    }

    /// The raw value under `key`, bypassing the call log.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every subsequent `set_item` fail as if the quota were exhausted.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `remove_item` fail with an I/O error.
    pub fn fail_removes(&self, fail: bool) {
        self.inner.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `get_item` fail with an I/O error.
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: StorageCall) {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl Default for StubStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for StubStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.record(StorageCall::Get(key.to_string()));
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("stub read failure")));
        }
        Ok(self.items().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.record(StorageCall::Set(key.to_string(), value.to_string()));
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded {
                needed: key.len() + value.len(),
                quota: 0,
            });
        }
        let old = self.items().insert(key.to_string(), value.to_string());
        self.inner
            .events
            .publish(self.origin, key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.record(StorageCall::Remove(key.to_string()));
        if self.inner.fail_removes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("stub remove failure")));
        }
        if let Some(old) = self.items().remove(key) {
            self.inner
                .events
                .publish(self.origin, key, Some(old), None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items().keys().cloned().collect())
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
