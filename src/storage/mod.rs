//! Synchronous key-value persistence for device-local state.
//!
//! Writes are durable when the call returns: the offline queue relies on
//! that to survive a restart right after an append.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::errors::SyncError;

/// Device-local string storage keyed by name.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;
    fn remove(&self, key: &str) -> Result<(), SyncError>;
}

/// In-memory store. Clones share the same entries, so dropping every user of
/// one clone and opening another behaves like a process restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// One JSON document per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, SyncError> {
        fs::create_dir_all(dir).map_err(|e| {
            SyncError::Storage(format!(
                "Failed to create storage directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Distinct keys map to distinct file names, even on case-insensitive file
/// systems: anything but lowercase ASCII, digits, `-` and `_` is written as
/// `%XX` per byte.
fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            stem.push('%');
            stem.push_str(&hex::encode_upper([byte]));
        }
    }
    stem
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        // Write-then-rename so a crash never leaves a half-written document.
        let mut file = fs::File::create(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
