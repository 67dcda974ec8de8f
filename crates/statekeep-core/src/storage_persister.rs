// ABOUTME: StoragePersister saves, loads, and clears state in a key/value Storage backend.
// ABOUTME: Discards records with a stale buster or past their max age, and reloads on storage-change events.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;

use crate::codec::CodecError;
use crate::options::StoragePersisterOptions;
use crate::persister::Persister;
use crate::record::PersistedRecord;
use crate::storage::{Storage, StorageError, StorageEvent};

/// Errors reported by persister operations. Load and save failures only ever
/// reach the configured callbacks; the subscription variants are returned by
/// [`StoragePersister::subscribe_to_storage`].
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to encode state: {0}")]
    Encode(#[source] CodecError),

    #[error("failed to decode stored state: {0}")]
    Decode(#[source] CodecError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no storage backend configured")]
    StorageUnavailable,

    #[error("storage backend does not publish change events")]
    NotObservable,

    #[error("no tokio runtime available to listen for storage changes")]
    NoRuntime,
}

/// Cancellation handle for a storage-change listener.
///
/// Dropping the handle leaves the listener running; call [`cancel`] or
/// [`StoragePersister::unsubscribe_from_storage`] to stop it.
///
/// [`cancel`]: StorageSubscription::cancel
#[derive(Debug, Clone)]
pub struct StorageSubscription {
    handle: AbortHandle,
}

impl StorageSubscription {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// A persister that keeps one serialized [`PersistedRecord`] per key in a
/// [`Storage`] backend.
///
/// Loads return `None` for absent, undecodable, version-mismatched, or
/// expired records; the last two are also removed from storage. Nothing
/// propagates out of load, save, or clear: failures are logged and handed to
/// the error callbacks, with clear failures going to `on_save_state_error`.
pub struct StoragePersister<T, S = T> {
    key: String,
    options: RwLock<StoragePersisterOptions<T, S>>,
    subscription: Mutex<Option<StorageSubscription>>,
}

impl<T: Clone, S> StoragePersister<T, S> {
    pub fn new(options: StoragePersisterOptions<T, S>) -> Self {
        Self {
            key: options.key().to_string(),
            options: RwLock::new(options),
            subscription: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// A snapshot of the current options.
    pub fn options(&self) -> StoragePersisterOptions<T, S> {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change options in place. Operations already running keep the options
    /// they started with; the key cannot change.
    pub fn update_options(&self, update: impl FnOnce(&mut StoragePersisterOptions<T, S>)) {
        let mut options = self
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut options);
    }

    /// Select, wrap, encode, and write `state`.
    pub fn save_state(&self, state: &T) {
        let options = self.options();
        let Some(storage) = options.storage.as_deref() else {
            tracing::debug!(key = %self.key, "no storage configured, skipping save");
            return;
        };

        match self.write_record(&options, storage, state) {
            Ok(()) => {
                if let Some(on_save) = &options.on_save_state {
                    on_save(state, self);
                }
            }
            Err(err) => {
                tracing::error!(key = %self.key, error = %err, "failed to save state");
                if let Some(on_error) = &options.on_save_state_error {
                    on_error(&err, self);
                }
            }
        }
    }

    /// Read, decode, and validate the stored record.
    pub fn load_state(&self) -> Option<S> {
        let options = self.options();
        let Some(storage) = options.storage.as_deref() else {
            tracing::debug!(key = %self.key, "no storage configured, nothing to load");
            return None;
        };

        match self.read_record(&options, storage) {
            Ok(Some(state)) => {
                if let Some(on_load) = &options.on_load_state {
                    on_load(&state, self);
                }
                Some(state)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::error!(key = %self.key, error = %err, "failed to load state");
                if let Some(on_error) = &options.on_load_state_error {
                    on_error(&err, self);
                }
                None
            }
        }
    }

    /// Remove the stored record, or overwrite it with the default state when
    /// `use_default_state` is set and one is configured. A failed removal is
    /// reported through `on_save_state_error`.
    pub fn clear_state(&self, use_default_state: bool) {
        let options = self.options();
        if use_default_state {
            if let Some(default_state) = &options.default_state {
                self.save_state(default_state);
                return;
            }
            tracing::debug!(key = %self.key, "no default state configured, removing instead");
        }

        let Some(storage) = options.storage.as_deref() else {
            return;
        };
        if let Err(err) = storage.remove_item(&self.key) {
            let err = PersistError::from(err);
            tracing::error!(key = %self.key, error = %err, "failed to clear state");
            if let Some(on_error) = &options.on_save_state_error {
                on_error(&err, self);
            }
        }
    }

    /// React to a change in some storage area. Reloads when the change is to
    /// this persister's key in its current storage, was made through another
    /// handle, and carries a new value.
    pub fn handle_storage_change(&self, event: &StorageEvent) {
        let Some(storage) = self.options().storage else {
            return;
        };
        if storage.area() != event.area || storage.origin() == event.origin {
            return;
        }
        if event.key == self.key && event.new_value.as_deref().is_some_and(|v| !v.is_empty()) {
            tracing::debug!(key = %self.key, "storage changed elsewhere, reloading");
            self.load_state();
        }
    }

    /// Cancel the listener registered by `subscribe_to_storage`, if any.
    pub fn unsubscribe_from_storage(&self) {
        if let Some(subscription) = self.subscription().take() {
            subscription.cancel();
        }
    }

    fn write_record(
        &self,
        options: &StoragePersisterOptions<T, S>,
        storage: &dyn Storage,
        state: &T,
    ) -> Result<(), PersistError> {
        let record = PersistedRecord::new(
            (options.select)(state),
            options.clock.now_millis(),
            options.buster.clone(),
        );
        let raw = options.codec.encode(&record).map_err(PersistError::Encode)?;
        storage.set_item(&self.key, &raw)?;
        Ok(())
    }

    fn read_record(
        &self,
        options: &StoragePersisterOptions<T, S>,
        storage: &dyn Storage,
    ) -> Result<Option<S>, PersistError> {
        let raw = match storage.get_item(&self.key)? {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(None),
        };

        let record = options.codec.decode(&raw).map_err(PersistError::Decode)?;
        let now = options.clock.now_millis();
        if !record.is_valid(options.buster.as_deref(), options.max_age, now) {
            tracing::debug!(
                key = %self.key,
                stored_buster = ?record.buster,
                stored_at = record.timestamp,
                "discarding stale state"
            );
            storage.remove_item(&self.key)?;
            return Ok(None);
        }

        Ok(Some(record.state))
    }

    fn subscription(&self) -> MutexGuard<'_, Option<StorageSubscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, S> StoragePersister<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Listen for change events from the configured storage and reload on
    /// relevant ones. Replaces any listener registered earlier. Must be called
    /// from within a tokio runtime.
    ///
    /// The listener holds only a weak reference to the persister and stops
    /// once the persister is dropped.
    pub fn subscribe_to_storage(self: &Arc<Self>) -> Result<StorageSubscription, PersistError> {
        let storage = self
            .options()
            .storage
            .ok_or(PersistError::StorageUnavailable)?;
        let mut events = storage.subscribe().ok_or(PersistError::NotObservable)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PersistError::NoRuntime)?;

        let persister = Arc::downgrade(self);
        let key = self.key.clone();
        let task = runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(persister) = persister.upgrade() else {
                            break;
                        };
                        persister.handle_storage_change(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(key = %key, skipped, "storage listener lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let subscription = StorageSubscription {
            handle: task.abort_handle(),
        };
        if let Some(previous) = self.subscription().replace(subscription.clone()) {
            previous.cancel();
        }
        Ok(subscription)
    }
}

impl<T, S> Drop for StoragePersister<T, S> {
    fn drop(&mut self) {
        let subscription = self
            .subscription
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

impl<T: Clone, S> Persister for StoragePersister<T, S> {
    type State = T;
    type Selected = S;

    fn key(&self) -> &str {
        &self.key
    }

    fn load_state(&self) -> Option<S> {
        StoragePersister::load_state(self)
    }

    fn save_state(&self, state: &T) {
        StoragePersister::save_state(self, state)
    }

    fn clear_state(&self, use_default_state: bool) {
        StoragePersister::clear_state(self, use_default_state)
    }
}

impl<T, S> fmt::Debug for StoragePersister<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoragePersister")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::codec::{Codec, CodecError, JsonCodec, YamlCodec};
    use crate::storage::StorageOrigin;
    use crate::testing::{StorageCall, StubStorage};
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        token: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SessionUser {
        user: String,
    }

    /// Encodes nothing; every write fails before reaching storage.
    struct BrokenCodec;

    impl Codec<Value> for BrokenCodec {
        fn encode(&self, _record: &PersistedRecord<Value>) -> Result<String, CodecError> {
            Err(serde_json::from_str::<Value>("{").unwrap_err().into())
        }

        fn decode(&self, raw: &str) -> Result<PersistedRecord<Value>, CodecError> {
            Ok(serde_json::from_str(raw)?)
        }
    }

    fn persister_with(
        storage: &StubStorage,
        configure: impl FnOnce(StoragePersisterOptions<Value>) -> StoragePersisterOptions<Value>,
    ) -> StoragePersister<Value> {
        let options = StoragePersisterOptions::new("test-key").with_storage(Arc::new(storage.clone()));
        StoragePersister::new(configure(options))
    }

    #[test]
    fn loads_state_from_storage() {
        let storage = StubStorage::new();
        let clock = FakeClock::new(10_000);
        storage.seed("test-key", r#"{"state":{"count":1},"timestamp":10000}"#);

        let persister = persister_with(&storage, |o| o.with_clock(Arc::new(clock.clone())));

        assert_eq!(persister.load_state(), Some(json!({"count": 1})));
    }

    #[test]
    fn missing_key_returns_none_without_error_callback() {
        let storage = StubStorage::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let persister = persister_with(&storage, move |o| {
            o.on_load_state_error(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });

        assert_eq!(persister.load_state(), None);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_value_is_treated_as_absent() {
        let storage = StubStorage::new();
        storage.seed("test-key", "");
        let persister = persister_with(&storage, |o| o);

        assert_eq!(persister.load_state(), None);
        assert_eq!(storage.raw("test-key").as_deref(), Some(""));
    }

    #[test]
    fn round_trips_without_select() {
        let storage = StubStorage::new();
        let persister = StoragePersister::new(
            StoragePersisterOptions::<Counter>::new("counter").with_storage(Arc::new(storage.clone())),
        );

        persister.save_state(&Counter { count: 3 });

        assert_eq!(persister.load_state(), Some(Counter { count: 3 }));
    }

    #[test]
    fn save_writes_record_shape() {
        let storage = StubStorage::new();
        let clock = FakeClock::new(1_234);
        let persister = persister_with(&storage, |o| {
            o.with_buster("v2").with_clock(Arc::new(clock.clone()))
        });

        persister.save_state(&json!({"count": 1}));

        let raw = storage.raw("test-key").unwrap();
        let stored: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            stored,
            json!({"state": {"count": 1}, "timestamp": 1234, "buster": "v2"})
        );
    }

    #[test]
    fn save_failure_reaches_callback_and_does_not_escape() {
        let storage = StubStorage::new();
        storage.fail_writes(true);

        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        let persister = persister_with(&storage, move |o| {
            o.on_save_state_error(move |err, persister| {
                sink.lock()
                    .unwrap()
                    .push((err.to_string(), persister.key().to_string()));
            })
        });

        persister.save_state(&json!({"count": 1}));

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].0.contains("quota exceeded"), "{}", failures[0].0);
        assert_eq!(failures[0].1, "test-key");
        assert!(storage.raw("test-key").is_none());
    }

    #[test]
    fn save_failure_hands_over_the_same_persister() {
        let storage = StubStorage::new();
        storage.fail_writes(true);

        let seen = Arc::new(Mutex::new(None::<usize>));
        let sink = Arc::clone(&seen);
        let persister = persister_with(&storage, move |o| {
            o.on_save_state_error(move |_, persister| {
                *sink.lock().unwrap() = Some(persister as *const _ as usize);
            })
        });

        persister.save_state(&json!(1));

        assert_eq!(*seen.lock().unwrap(), Some(&persister as *const _ as usize));
    }

    #[test]
    fn on_save_state_receives_unselected_state() {
        let storage = StubStorage::new();
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&saved);
        let persister = StoragePersister::new(
            StoragePersisterOptions::<Session, SessionUser>::selecting("session", |s: &Session| {
                SessionUser {
                    user: s.user.clone(),
                }
            })
            .with_storage(Arc::new(storage.clone()))
            .on_save_state(move |state, _| sink.lock().unwrap().push(state.clone())),
        );

        let session = Session {
            user: "ada".to_string(),
            token: "t0k3n".to_string(),
        };
        persister.save_state(&session);

        assert_eq!(*saved.lock().unwrap(), vec![session]);
        let raw = storage.raw("session").unwrap();
        assert!(!raw.contains("t0k3n"));
        assert_eq!(
            persister.load_state(),
            Some(SessionUser {
                user: "ada".to_string()
            })
        );
    }

    #[test]
    fn on_load_state_receives_loaded_state() {
        let storage = StubStorage::new();
        let loaded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&loaded);
        let persister = persister_with(&storage, move |o| {
            o.on_load_state(move |state, _| sink.lock().unwrap().push(state.clone()))
        });

        persister.save_state(&json!({"count": 1}));
        persister.load_state();

        assert_eq!(*loaded.lock().unwrap(), vec![json!({"count": 1})]);
    }

    #[test]
    fn buster_mismatch_discards_and_removes() {
        let storage = StubStorage::new();
        storage.seed(
            "test-key",
            r#"{"state":{"count":1},"timestamp":1,"buster":"v1"}"#,
        );
        let loads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&loads);
        let persister = persister_with(&storage, move |o| {
            o.with_buster("v2").on_load_state(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });

        assert_eq!(persister.load_state(), None);
        assert!(storage.raw("test-key").is_none());
        assert!(storage.calls().contains(&StorageCall::Remove("test-key".to_string())));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn matching_buster_loads() {
        let storage = StubStorage::new();
        let persister = persister_with(&storage, |o| o.with_buster("v2"));

        persister.save_state(&json!("hello"));

        assert_eq!(persister.load_state(), Some(json!("hello")));
    }

    #[test]
    fn max_age_expiry_scenario() {
        let storage = StubStorage::new();
        let clock = FakeClock::new(0);
        let persister = persister_with(&storage, |o| {
            o.with_max_age(Duration::from_millis(1000))
                .with_clock(Arc::new(clock.clone()))
        });

        persister.save_state(&json!({"count": 1}));

        clock.set(500);
        assert_eq!(persister.load_state(), Some(json!({"count": 1})));

        clock.set(1500);
        assert_eq!(persister.load_state(), None);
        assert!(storage.raw("test-key").is_none());
    }

    #[test]
    fn record_exactly_max_age_old_is_kept() {
        let storage = StubStorage::new();
        let clock = FakeClock::new(0);
        let persister = persister_with(&storage, |o| {
            o.with_max_age(Duration::from_millis(1000))
                .with_clock(Arc::new(clock.clone()))
        });

        persister.save_state(&json!(1));
        clock.advance(Duration::from_millis(1000));

        assert_eq!(persister.load_state(), Some(json!(1)));
    }

    #[test]
    fn zero_max_age_never_expires() {
        let storage = StubStorage::new();
        let clock = FakeClock::new(0);
        let persister = persister_with(&storage, |o| {
            o.with_max_age(Duration::ZERO)
                .with_clock(Arc::new(clock.clone()))
        });

        persister.save_state(&json!(1));
        clock.set(i64::MAX / 2);

        assert_eq!(persister.load_state(), Some(json!(1)));
    }

    #[test]
    fn undecodable_record_reports_load_error() {
        let storage = StubStorage::new();
        storage.seed("test-key", "{definitely not json");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let persister = persister_with(&storage, move |o| {
            o.on_load_state_error(move |err, _| {
                sink.lock()
                    .unwrap()
                    .push(matches!(err, PersistError::Decode(_)))
            })
        });

        assert_eq!(persister.load_state(), None);
        assert_eq!(*errors.lock().unwrap(), vec![true]);
        // Undecodable records are left in place.
        assert!(storage.raw("test-key").is_some());
    }

    #[test]
    fn read_failure_reports_load_error() {
        let storage = StubStorage::new();
        storage.fail_reads(true);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let persister = persister_with(&storage, move |o| {
            o.on_load_state_error(move |err, _| {
                assert!(matches!(err, PersistError::Storage(_)));
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });

        assert_eq!(persister.load_state(), None);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_state_removes_entry() {
        let storage = StubStorage::new();
        let persister = persister_with(&storage, |o| o);

        persister.save_state(&json!(1));
        persister.clear_state(false);

        assert!(storage.raw("test-key").is_none());
        assert_eq!(persister.load_state(), None);
    }

    #[test]
    fn clear_state_with_default_saves_default() {
        let storage = StubStorage::new();
        let persister = persister_with(&storage, |o| o.with_default_state(json!({"count": 0})));

        persister.save_state(&json!({"count": 9}));
        persister.clear_state(true);

        assert_eq!(persister.load_state(), Some(json!({"count": 0})));
    }

    #[test]
    fn clear_state_with_default_but_none_configured_removes() {
        let storage = StubStorage::new();
        let persister = persister_with(&storage, |o| o);

        persister.save_state(&json!(5));
        persister.clear_state(true);

        assert!(storage.raw("test-key").is_none());
    }

    #[test]
    fn clear_failure_reaches_save_error_callback() {
        let storage = StubStorage::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let persister = persister_with(&storage, move |o| {
            o.on_save_state_error(move |err, _| {
                sink.lock()
                    .unwrap()
                    .push(matches!(err, PersistError::Storage(_)))
            })
        });
        persister.save_state(&json!(1));
        storage.fail_removes(true);

        persister.clear_state(false);

        assert_eq!(*errors.lock().unwrap(), vec![true]);
        assert!(storage.raw("test-key").is_some());
    }

    #[test]
    fn encode_failure_reaches_save_error_callback_and_writes_nothing() {
        let storage = StubStorage::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let saves = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&errors);
        let seen = Arc::clone(&saves);
        let persister = persister_with(&storage, move |o| {
            o.with_codec(Arc::new(BrokenCodec))
                .on_save_state(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .on_save_state_error(move |err, _| {
                    sink.lock()
                        .unwrap()
                        .push(matches!(err, PersistError::Encode(_)))
                })
        });

        persister.save_state(&json!({"count": 1}));

        assert_eq!(*errors.lock().unwrap(), vec![true]);
        assert_eq!(saves.load(Ordering::SeqCst), 0);
        assert!(storage.raw("test-key").is_none());
        assert!(
            !storage
                .calls()
                .iter()
                .any(|call| matches!(call, StorageCall::Set(..)))
        );
    }

    #[test]
    fn failed_stale_removal_reports_load_error() {
        let storage = StubStorage::new();
        storage.seed(
            "test-key",
            r#"{"state":{"count":1},"timestamp":1,"buster":"v1"}"#,
        );
        storage.fail_removes(true);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let persister = persister_with(&storage, move |o| {
            o.with_buster("v2").on_load_state_error(move |err, _| {
                sink.lock()
                    .unwrap()
                    .push(matches!(err, PersistError::Storage(_)))
            })
        });

        assert_eq!(persister.load_state(), None);
        assert_eq!(*errors.lock().unwrap(), vec![true]);
        assert!(storage.raw("test-key").is_some());
    }

    #[test]
    fn without_storage_everything_is_a_noop() {
        let saves = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&saves);
        let persister = StoragePersister::new(
            StoragePersisterOptions::<Value>::new("nowhere")
                .on_save_state(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );

        persister.save_state(&json!(1));
        persister.clear_state(false);
        persister.clear_state(true);

        assert_eq!(persister.load_state(), None);
        assert_eq!(saves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn custom_codec_is_used_both_ways() {
        let storage = StubStorage::new();
        let persister = StoragePersister::new(
            StoragePersisterOptions::<Counter>::new("yaml")
                .with_storage(Arc::new(storage.clone()))
                .with_codec(Arc::new(YamlCodec::new())),
        );

        persister.save_state(&Counter { count: 8 });

        let raw = storage.raw("yaml").unwrap();
        assert!(raw.contains("count: 8"), "{raw}");
        assert_eq!(persister.load_state(), Some(Counter { count: 8 }));

        persister.update_options(|o| o.codec = Arc::new(JsonCodec::new()));
        assert_eq!(persister.load_state(), None);
    }

    #[test]
    fn update_options_applies_to_later_calls() {
        let storage = StubStorage::new();
        let persister = persister_with(&storage, |o| o.with_buster("v1"));

        persister.save_state(&json!(1));
        persister.update_options(|o| o.buster = Some("v2".to_string()));

        assert_eq!(persister.options().buster.as_deref(), Some("v2"));
        assert_eq!(persister.load_state(), None);
        assert_eq!(persister.key(), "test-key");
    }

    #[test]
    fn callbacks_may_update_options() {
        let storage = StubStorage::new();
        let persister = persister_with(&storage, |o| {
            o.on_save_state(|_, persister| {
                persister.update_options(|o| o.buster = Some("after-save".to_string()));
            })
        });

        persister.save_state(&json!(1));

        assert_eq!(persister.options().buster.as_deref(), Some("after-save"));
    }

    #[test]
    fn storage_change_for_other_key_area_or_own_origin_is_ignored() {
        let storage = StubStorage::new();
        let other = StubStorage::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&loads);
        let persister = persister_with(&storage, move |o| {
            o.on_load_state(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        });
        persister.save_state(&json!(1));
        let elsewhere = StorageOrigin::unique();

        persister.handle_storage_change(&StorageEvent {
            area: other.area(),
            origin: elsewhere,
            key: "test-key".to_string(),
            old_value: None,
            new_value: Some("x".to_string()),
        });
        persister.handle_storage_change(&StorageEvent {
            area: storage.area(),
            origin: elsewhere,
            key: "another-key".to_string(),
            old_value: None,
            new_value: Some("x".to_string()),
        });
        persister.handle_storage_change(&StorageEvent {
            area: storage.area(),
            origin: elsewhere,
            key: "test-key".to_string(),
            old_value: Some("x".to_string()),
            new_value: None,
        });
        persister.handle_storage_change(&StorageEvent {
            area: storage.area(),
            origin: storage.origin(),
            key: "test-key".to_string(),
            old_value: None,
            new_value: Some("x".to_string()),
        });
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        persister.handle_storage_change(&StorageEvent {
            area: storage.area(),
            origin: elsewhere,
            key: "test-key".to_string(),
            old_value: None,
            new_value: Some("x".to_string()),
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_without_storage_fails() {
        let persister = Arc::new(StoragePersister::new(StoragePersisterOptions::<Value>::new("k")));
        assert!(matches!(
            persister.subscribe_to_storage(),
            Err(PersistError::StorageUnavailable)
        ));
    }

    #[test]
    fn subscribe_outside_runtime_fails() {
        let storage = StubStorage::new();
        let persister = Arc::new(persister_with(&storage, |o| o));
        assert!(matches!(
            persister.subscribe_to_storage(),
            Err(PersistError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn subscription_reloads_on_writes_from_another_persister() {
        let storage = StubStorage::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reader = Arc::new(persister_with(&storage, move |o| {
            o.on_load_state(move |state, _| {
                let _ = tx.send(state.clone());
            })
        }));
        let writer = persister_with(&storage.new_handle(), |o| o);

        let subscription = reader.subscribe_to_storage().unwrap();
        assert!(subscription.is_active());

        writer.save_state(&json!({"count": 42}));

        let reloaded = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded, json!({"count": 42}));
    }

    #[tokio::test]
    async fn own_writes_do_not_trigger_reload() {
        let storage = StubStorage::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&loads);
        let persister = Arc::new(persister_with(&storage, move |o| {
            o.on_load_state(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        }));
        let subscription = persister.subscribe_to_storage().unwrap();

        persister.save_state(&json!(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(subscription.is_active());
    }

    #[tokio::test]
    async fn clones_of_one_handle_share_an_origin() {
        let storage = StubStorage::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&loads);
        let reader = Arc::new(persister_with(&storage, move |o| {
            o.on_load_state(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        }));
        let same_tab = persister_with(&storage, |o| o);
        let _subscription = reader.subscribe_to_storage().unwrap();

        same_tab.save_state(&json!(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(storage.clone().origin(), storage.origin());
        assert_ne!(storage.new_handle().origin(), storage.origin());
    }

    #[tokio::test]
    async fn unsubscribe_stops_reloads() {
        let storage = StubStorage::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reader = Arc::new(persister_with(&storage, move |o| {
            o.on_load_state(move |state, _| {
                let _ = tx.send(state.clone());
            })
        }));
        let writer = persister_with(&storage.new_handle(), |o| o);

        let subscription = reader.subscribe_to_storage().unwrap();
        reader.unsubscribe_from_storage();
        tokio::task::yield_now().await;

        writer.save_state(&json!(1));

        let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(outcome.is_err(), "no reload expected after unsubscribe");
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn resubscribing_replaces_previous_listener() {
        let storage = StubStorage::new();
        let persister = Arc::new(persister_with(&storage, |o| o));

        let first = persister.subscribe_to_storage().unwrap();
        let second = persister.subscribe_to_storage().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!first.is_active());
        assert!(second.is_active());
        second.cancel();
    }
}
