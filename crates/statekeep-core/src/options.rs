// ABOUTME: Configuration for StoragePersister: key, staleness rules, codec, projection, and callbacks.
// ABOUTME: Built with a consuming builder and cloned cheaply when a persister operation starts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::clock::{Clock, SystemClock};
use crate::codec::{Codec, JsonCodec};
use crate::storage::Storage;
use crate::storage_persister::{PersistError, StoragePersister};

/// Narrows the full state to the part that is persisted.
pub type Selector<T, S> = Arc<dyn Fn(&T) -> S + Send + Sync>;

/// Runs after a valid state was loaded.
pub type LoadCallback<T, S> = Arc<dyn Fn(&S, &StoragePersister<T, S>) + Send + Sync>;

/// Runs after a state was written.
pub type SaveCallback<T, S> = Arc<dyn Fn(&T, &StoragePersister<T, S>) + Send + Sync>;

/// Runs after a load or save failed.
pub type ErrorCallback<T, S> = Arc<dyn Fn(&PersistError, &StoragePersister<T, S>) + Send + Sync>;

/// Options recognised by [`StoragePersister`].
///
/// Only the key is required. Without a storage backend every operation is a
/// no-op and loads return `None`.
pub struct StoragePersisterOptions<T, S = T> {
    key: String,
    /// Version tag written into every record; records carrying a different
    /// tag are discarded on load.
    pub buster: Option<String>,
    /// State written by `clear_state(true)`.
    pub default_state: Option<T>,
    pub codec: Arc<dyn Codec<S>>,
    /// Records older than this are discarded on load. Zero never expires.
    pub max_age: Option<Duration>,
    pub on_load_state: Option<LoadCallback<T, S>>,
    pub on_load_state_error: Option<ErrorCallback<T, S>>,
    pub on_save_state: Option<SaveCallback<T, S>>,
    pub on_save_state_error: Option<ErrorCallback<T, S>>,
    pub select: Selector<T, S>,
    pub storage: Option<Arc<dyn Storage>>,
    pub clock: Arc<dyn Clock>,
}

impl<T, S> StoragePersisterOptions<T, S>
where
    T: Clone + 'static,
    S: From<T> + Serialize + DeserializeOwned + 'static,
{
    /// Options persisting the whole state under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self::selecting(key, |state: &T| S::from(state.clone()))
    }
}

impl<T, S> StoragePersisterOptions<T, S>
where
    T: 'static,
    S: Serialize + DeserializeOwned + 'static,
{
    /// Options persisting only what `select` extracts from the state.
    pub fn selecting(
        key: impl Into<String>,
        select: impl Fn(&T) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            buster: None,
            default_state: None,
            codec: Arc::new(JsonCodec::new()),
            max_age: None,
            on_load_state: None,
            on_load_state_error: None,
            on_save_state: None,
            on_save_state_error: None,
            select: Arc::new(select),
            storage: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl<T, S> StoragePersisterOptions<T, S> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_buster(mut self, buster: impl Into<String>) -> Self {
        self.buster = Some(buster.into());
        self
    }

    pub fn with_default_state(mut self, state: T) -> Self {
        self.default_state = Some(state);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec<S>>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_select(mut self, select: impl Fn(&T) -> S + Send + Sync + 'static) -> Self {
        self.select = Arc::new(select);
        self
    }

    pub fn on_load_state(
        mut self,
        f: impl Fn(&S, &StoragePersister<T, S>) + Send + Sync + 'static,
    ) -> Self {
        self.on_load_state = Some(Arc::new(f));
        self
    }

    pub fn on_load_state_error(
        mut self,
        f: impl Fn(&PersistError, &StoragePersister<T, S>) + Send + Sync + 'static,
    ) -> Self {
        self.on_load_state_error = Some(Arc::new(f));
        self
    }

    pub fn on_save_state(
        mut self,
        f: impl Fn(&T, &StoragePersister<T, S>) + Send + Sync + 'static,
    ) -> Self {
        self.on_save_state = Some(Arc::new(f));
        self
    }

    /// Called when a write fails, e.g. when the backend's quota is exhausted.
    pub fn on_save_state_error(
        mut self,
        f: impl Fn(&PersistError, &StoragePersister<T, S>) + Send + Sync + 'static,
    ) -> Self {
        self.on_save_state_error = Some(Arc::new(f));
        self
    }
}

impl<T: Clone, S> Clone for StoragePersisterOptions<T, S> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            buster: self.buster.clone(),
            default_state: self.default_state.clone(),
            codec: Arc::clone(&self.codec),
            max_age: self.max_age,
            on_load_state: self.on_load_state.clone(),
            on_load_state_error: self.on_load_state_error.clone(),
            on_save_state: self.on_save_state.clone(),
            on_save_state_error: self.on_save_state_error.clone(),
            select: Arc::clone(&self.select),
            storage: self.storage.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T, S> fmt::Debug for StoragePersisterOptions<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoragePersisterOptions")
            .field("key", &self.key)
            .field("buster", &self.buster)
            .field("has_default_state", &self.default_state.is_some())
            .field("max_age", &self.max_age)
            .field("storage", &self.storage.as_ref().map(|s| s.area()))
            .finish_non_exhaustive()
    }
}
