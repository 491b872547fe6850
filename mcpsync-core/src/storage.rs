//! Persistence backends for the config blob.
//!
//! A [`Storage`] is a flat key → bytes store. The [`ConfigStore`](crate::ConfigStore)
//! owns the encoding; backends only move bytes.
//!
//! [`FileStorage`] writes follow the `.tmp` sibling → `chmod 0600` → `rename`
//! flow so a reader never observes a half-written file.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{io_err, StorageError};

/// Backend contract consumed by the config store.
pub trait Storage: Send + Sync {
    /// Read the blob stored under `key`; `Ok(None)` when absent.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys currently stored, sorted.
    fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Filesystem path a change watcher can observe for `key`, if any.
    fn watch_path(&self, key: &str) -> Option<PathBuf>;

    /// Human-readable location, used in logs and status payloads.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// File storage
// ---------------------------------------------------------------------------

/// Stores each key as a file under `root`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<key>`. Rejects keys that would escape `root`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "keys must be relative paths without '..'".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn ensure_root(&self) -> Result<(), StorageError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
            set_dir_permissions(&self.root)?;
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(path, err)),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_root()?;
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        std::fs::write(&tmp, data).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(path, err));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(path, err)),
        }
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&self.root, err)),
        };
        let mut keys: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(".tmp"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn watch_path(&self, key: &str) -> Option<PathBuf> {
        self.path_for(key).ok()
    }

    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Memory storage
// ---------------------------------------------------------------------------

/// Process-local storage; nothing survives a restart and nothing is watchable.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.blobs.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.lock().remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.blobs.lock().keys().cloned().collect())
    }

    fn watch_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
