// ABOUTME: Directory-backed storage area holding one file per key.
// ABOUTME: Writes go through a unique temp file, fsync, and atomic rename so a crash never leaves a torn value.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use statekeep_core::storage::{
    Storage, StorageArea, StorageError, StorageEvent, StorageEvents, StorageOrigin,
};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

const VALUE_EXTENSION: &str = "json";
const KEY_EXTENSION: &str = "key";
const HASHED_PREFIX: &str = "h-";

/// Longest hex-encoded key used directly as a file stem. Longer keys are
/// stored under a digest so names stay well inside NAME_MAX.
const MAX_HEX_STEM: usize = 200;

struct FileInner {
    dir: PathBuf,
    events: StorageEvents,
}

/// Stores each key as `<hex(key)>.json` under a root directory. Keys are
/// hex-encoded so any string is a valid key; keys too long for that live in
/// `h-<sha256(key)>.json` with the key itself in a `.key` sidecar.
///
/// Clones share the change channel and the origin. Two stores opened
/// separately on the same directory are separate areas.
#[derive(Clone)]
pub struct FileStorage {
    inner: Arc<FileInner>,
    origin: StorageOrigin,
}

impl FileStorage {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            inner: Arc::new(FileInner {
                dir: dir.to_path_buf(),
                events: StorageEvents::new(),
            }),
            origin: StorageOrigin::unique(),
        })
    }

    /// Another handle on the same area with its own origin.
    pub fn new_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: StorageOrigin::unique(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the file holding `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.inner
            .dir
            .join(format!("{}.{VALUE_EXTENSION}", file_stem(key)))
    }

    /// Sidecar recording the original key, for keys stored under a digest.
    fn sidecar_for(&self, key: &str) -> Option<PathBuf> {
        let stem = file_stem(key);
        stem.starts_with(HASHED_PREFIX)
            .then(|| self.inner.dir.join(format!("{stem}.{KEY_EXTENSION}")))
    }

    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The current value for change events. Never fails: unreadable or
    /// non-UTF-8 contents must not block a write or removal.
    fn previous_value(&self, key: &str) -> Option<String> {
        fs::read(self.path_for(key))
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `contents` to `path` through a uniquely named temp file in the
    /// store directory. The temp file is removed if any step fails.
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), StorageError> {
        let mut file = NamedTempFile::new_in(&self.inner.dir)?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn key_from_sidecar(&self, stem: &str) -> Option<String> {
        let path = self.inner.dir.join(format!("{stem}.{KEY_EXTENSION}"));
        match fs::read_to_string(&path) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "unreadable key sidecar");
                None
            }
        }
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.read(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old = self.previous_value(key);

        if let Some(sidecar) = self.sidecar_for(key) {
            self.write_atomic(&sidecar, key.as_bytes())?;
        }
        self.write_atomic(&self.path_for(key), value.as_bytes())?;

        self.inner
            .events
            .publish(self.origin, key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let old = self.previous_value(key);
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(sidecar) = self.sidecar_for(key) {
            match fs::remove_file(&sidecar) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.events.publish(self.origin, key, old, None);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.inner.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            // Match pattern: <hex>.json or h-<digest>.json
            if let Some(stem) = name_str.strip_suffix(&format!(".{VALUE_EXTENSION}")) {
                let key = if stem.starts_with(HASHED_PREFIX) {
                    self.key_from_sidecar(stem)
                } else {
                    decode_stem(stem)
                };
                match key {
                    Some(key) => keys.push(key),
                    None => {
                        tracing::debug!(file = %name_str, "skipping foreign file in storage dir");
                    }
                }
            } else if !name_str.ends_with(&format!(".{KEY_EXTENSION}")) {
                tracing::debug!(file = %name_str, "skipping foreign file in storage dir");
            }
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

/// File stem for `key`: its hex encoding, or a digest when that is too long.
fn file_stem(key: &str) -> String {
    let encoded = hex::encode(key);
    if encoded.len() <= MAX_HEX_STEM {
        encoded
    } else {
        format!("{HASHED_PREFIX}{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn decode_stem(stem: &str) -> Option<String> {
    String::from_utf8(hex::decode(stem).ok()?).ok()
}
