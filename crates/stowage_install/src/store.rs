//! Persistent key value storage for install markers.
//!
//! The installed payload version and the custom install flag must survive
//! replacing the payload tree, so they are kept outside of it.

use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs_err as fs;

/// An error that can occur while reading or writing a [`VersionStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An io error occurred.
    #[error("{0}")]
    IoError(String, #[source] std::io::Error),

    /// The stored data could not be parsed.
    #[error("failed to parse {0}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

/// Opaque string storage keyed by name.
pub trait VersionStore: Send + Sync {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Stores all values as a single JSON object in a file.
///
/// Every modification rewrites the whole file through a temporary file in the
/// same directory, so a crash never leaves a half written store behind.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Uses the file at `path`. The file is created on the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(StoreError::IoError(
                    format!("failed to read {}", self.path.display()),
                    err,
                ))
            }
        };
        serde_json::from_str(&contents).map_err(|err| StoreError::Parse(self.path.clone(), err))
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| {
            StoreError::IoError(format!("failed to create {}", parent.display()), err)
        })?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent).map_err(|err| {
            StoreError::IoError(
                format!("failed to create a temporary file in {}", parent.display()),
                err,
            )
        })?;
        let bytes = serde_json::to_vec_pretty(values)
            .map_err(|err| StoreError::Parse(self.path.clone(), err))?;
        temp_file.write_all(&bytes).map_err(|err| {
            StoreError::IoError(
                format!("failed to write {}", temp_file.path().display()),
                err,
            )
        })?;
        temp_file.persist(&self.path).map_err(|err| {
            StoreError::IoError(format!("failed to persist {}", self.path.display()), err.error)
        })?;
        Ok(())
    }
}

impl VersionStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.load()?;
        values.insert(key.to_owned(), value.to_owned());
        self.save(&values)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.load()?;
        if values.remove(key).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }
}

/// A store that only lives in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // The map stays consistent even if a holder panicked.
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl VersionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values().remove(key);
        Ok(())
    }
}
