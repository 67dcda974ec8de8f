// ABOUTME: The persister contracts: load, save, and clear state under a single string key.
// ABOUTME: Persister is synchronous; AsyncPersister exposes the same operations to async callers.

use async_trait::async_trait;

/// Saves and loads state to a storage medium under one key.
///
/// `State` is what callers hand in; `Selected` is the subset actually
/// persisted and handed back on load.
pub trait Persister {
    type State;
    type Selected;

    /// The storage key this persister owns.
    fn key(&self) -> &str;

    /// Load the persisted state, `None` when nothing valid is stored.
    fn load_state(&self) -> Option<Self::Selected>;

    /// Persist `state`. Failures are reported out of band, never returned.
    fn save_state(&self, state: &Self::State);

    /// Remove the persisted state, or overwrite it with the configured
    /// default when `use_default_state` is set.
    fn clear_state(&self, use_default_state: bool);
}

/// The persister contract for callers on an async runtime, and for backends
/// whose natural interface is asynchronous.
#[async_trait]
pub trait AsyncPersister: Send + Sync {
    type State: Sync;
    type Selected: Send;

    fn key(&self) -> &str;

    async fn load_state(&self) -> Option<Self::Selected>;

    async fn save_state(&self, state: &Self::State);

    async fn clear_state(&self, use_default_state: bool);
}

#[async_trait]
impl<P> AsyncPersister for P
where
    P: Persister + Send + Sync,
    P::State: Sync,
    P::Selected: Send,
{
    type State = P::State;
    type Selected = P::Selected;

    fn key(&self) -> &str {
        Persister::key(self)
    }

    async fn load_state(&self) -> Option<Self::Selected> {
        Persister::load_state(self)
    }

    async fn save_state(&self, state: &Self::State) {
        Persister::save_state(self, state)
    }

    async fn clear_state(&self, use_default_state: bool) {
        Persister::clear_state(self, use_default_state)
    }
}
