//! Narrow key-value preference stores.
//!
//! Components receive a `PreferenceStore` explicitly instead of reaching for
//! global state, so the bootstrap path can be exercised without a real
//! filesystem. Values are opaque strings; callers own their encoding.

use crate::error::{PreferenceError, PreferenceResult};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A small persistent key-value area.
pub trait PreferenceStore: Send + Sync {
    /// Read a value, `None` when unset.
    fn get(&self, key: &str) -> PreferenceResult<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> PreferenceResult<()>;

    /// Remove a value. Removing an unset key is not an error.
    fn remove(&self, key: &str) -> PreferenceResult<()>;

    /// Drop every value, including any unreadable backing data.
    fn clear(&self) -> PreferenceResult<()>;
}

/// Preferences persisted as a single JSON object on disk.
///
/// Writes go through a temp file that is synced and renamed over the
/// original, so a crash never leaves a half-written file behind.
///
/// An unparseable file fails every operation with
/// [`PreferenceError::Corrupt`] until it is cleared, unless the store was
/// built with [`JsonFilePreferences::set_aside_corrupt`].
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    set_aside_corrupt: bool,
    lock: Mutex<()>,
}

impl JsonFilePreferences {
    /// Create a store backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            set_aside_corrupt: false,
            lock: Mutex::new(()),
        }
    }

    /// Move an unparseable file aside and start empty instead of failing.
    ///
    /// Only for stores whose values can be lost without harm.
    #[must_use]
    pub fn set_aside_corrupt(mut self) -> Self {
        self.set_aside_corrupt = true;
        self
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> PreferenceResult<BTreeMap<String, String>> {
        match self.read() {
            Err(PreferenceError::Corrupt { reason, .. }) if self.set_aside_corrupt => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %reason,
                    "Preference file is corrupt; moving it aside"
                );
                if let Err(err) = self.move_aside() {
                    tracing::warn!(error = %err, "Failed to move corrupt preference file");
                }
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn read(&self) -> PreferenceResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents).map_err(|err| PreferenceError::Corrupt {
            path: self.path.clone(),
            reason: err.to_string(),
        })
    }

    fn move_aside(&self) -> std::io::Result<PathBuf> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prefs".to_string());
        let corrupt_path = self
            .path
            .with_file_name(format!("{file_name}.corrupt.{millis}"));
        fs::rename(&self.path, &corrupt_path)?;
        Ok(corrupt_path)
    }

    fn store(&self, map: &BTreeMap<String, String>) -> PreferenceResult<()> {
        let content = serde_json::to_string_pretty(map)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = create_private_file(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> PreferenceResult<Option<String>> {
        let _guard = self.lock.lock().map_err(|_| PreferenceError::Poisoned)?;
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PreferenceResult<()> {
        let _guard = self.lock.lock().map_err(|_| PreferenceError::Poisoned)?;
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        self.store(&map)
    }

    fn remove(&self, key: &str) -> PreferenceResult<()> {
        let _guard = self.lock.lock().map_err(|_| PreferenceError::Poisoned)?;
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.store(&map)?;
        }
        Ok(())
    }

    fn clear(&self) -> PreferenceResult<()> {
        let _guard = self.lock.lock().map_err(|_| PreferenceError::Poisoned)?;
        match self.read() {
            Ok(map) if map.is_empty() => Ok(()),
            Ok(_) => Ok(fs::remove_file(&self.path)?),
            Err(PreferenceError::Corrupt { .. }) => {
                let moved = self.move_aside()?;
                tracing::warn!(
                    path = %moved.display(),
                    "Corrupt preference file moved aside"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Process-local preferences.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> PreferenceResult<Option<String>> {
        let values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> PreferenceResult<()> {
        let mut values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> PreferenceResult<()> {
        let mut values = self.values.lock().map_err(|_| PreferenceError::Poisoned)?;
        values.remove(key);
        Ok(())
    }

    fn clear(&self) -> PreferenceResult<()> {
        self.values
            .lock()
            .map_err(|_| PreferenceError::Poisoned)?
            .clear();
        Ok(())
    }
}
