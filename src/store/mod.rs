//! Local key/value persistence, the analogue of browser local storage.
//!
//! DESIGN
//! ======
//! Writes are last-write-wins. `FileStore` mirrors the whole map in memory
//! and rewrites the JSON file on every change (write to a sibling temp file,
//! then rename), which is plenty for a handful of small auth keys.

pub mod fallback;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

pub use fallback::{CachedSession, CachedUser, FallbackStore, SignupHints};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait KeyValueStore: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    ///
    /// Returns a [`StoreError`] if the value cannot be persisted.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns a [`StoreError`] if the removal cannot be persisted.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`. A file that does not
    /// parse is treated as empty and overwritten by the next write.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if an existing file cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "discarding unreadable session store");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        apply(&mut entries);
        self.flush(&entries)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
