// ABOUTME: Core library for statekeep: the persister contract and the storage-backed persister.
// ABOUTME: Defines records, codecs, clocks, the storage capability, and structural comparison helpers.

pub mod clock;
pub mod codec;
pub mod compare;
pub mod options;
pub mod persister;
pub mod record;
pub mod storage;
pub mod storage_persister;
pub mod testing;

pub use clock::{Clock, FakeClock, SystemClock};
pub use codec::{Codec, CodecError, JsonCodec, YamlCodec};
pub use compare::{replace_equal_deep, shallow_equal_objects};
pub use options::StoragePersisterOptions;
pub use persister::{AsyncPersister, Persister};
pub use record::PersistedRecord;
pub use storage::{
    Storage, StorageArea, StorageError, StorageEvent, StorageEvents, StorageOrigin,
};
pub use storage_persister::{PersistError, StoragePersister, StorageSubscription};
