//! Persisted watch registrations
//!
//! One registration per [`WatchKey`]. The file store keeps one JSON file per
//! key under a state directory; the in-memory store is for tests.

use anyhow::{Context, Result};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::{WatchKey, WatchRegistration};

/// Storage for watch registrations
pub trait WatchStateStore: Send + Sync {
    /// Load the registration for `key`, if one was saved
    fn load(&self, key: &WatchKey) -> Result<Option<WatchRegistration>>;

    /// Insert or replace the registration under its key
    fn save(&self, registration: &WatchRegistration) -> Result<()>;

    /// Remove the registration for `key`; missing entries are not an error
    fn delete(&self, key: &WatchKey) -> Result<()>;
}

/// JSON files in a directory, one per key
pub struct FileWatchStore {
    dir: PathBuf,
}

impl FileWatchStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<state dir>/watches`
    pub fn default_location() -> Result<Self> {
        let state = config::state_dir().context("Could not determine state directory")?;
        Ok(Self::new(state.join("watches")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &WatchKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl WatchStateStore for FileWatchStore {
    fn load(&self, key: &WatchKey) -> Result<Option<WatchRegistration>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let registration: WatchRegistration = config::load_json_file(&path)?;
        Ok(Some(registration))
    }

    fn save(&self, registration: &WatchRegistration) -> Result<()> {
        let path = self.path_for(&registration.key());
        config::save_json_file(&path, registration)?;
        debug!("Saved watch registration to {}", path.display());
        Ok(())
    }

    fn delete(&self, key: &WatchKey) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// In-memory implementation of [`WatchStateStore`]
///
/// Stored registrations come back with `owned` cleared, as they would from
/// disk.
#[derive(Default)]
pub struct InMemoryWatchStore {
    entries: RwLock<HashMap<WatchKey, WatchRegistration>>,
}

impl InMemoryWatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl WatchStateStore for InMemoryWatchStore {
    fn load(&self, key: &WatchKey) -> Result<Option<WatchRegistration>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn save(&self, registration: &WatchRegistration) -> Result<()> {
        let mut stored = registration.clone();
        stored.owned = false;
        self.entries.write().insert(stored.key(), stored);
        Ok(())
    }

    fn delete(&self, key: &WatchKey) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}
