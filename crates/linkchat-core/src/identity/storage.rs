//! Storage abstraction for identity material
//!
//! The key store persists exactly one blob, but it talks to storage through a small
//! key-value trait so hosts can plug in a platform keychain. Two implementations ship
//! here: an in-memory map for tests and a directory of files for desktop hosts.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::StorageError;

// ----------------------------------------------------------------------------
// Storage Trait
// ----------------------------------------------------------------------------

/// Key-value storage abstraction for identity data
pub trait SecureStorage: Send + Sync {
    /// Store data under a key, replacing any previous value
    fn store(&mut self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Retrieve data by key
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete data by key
    fn delete(&mut self, key: &str) -> Result<(), StorageError>;

    /// List all keys
    fn list_keys(&self) -> Result<Vec<String>, StorageError>;

    /// Clear all stored data
    fn clear_all(&mut self) -> Result<(), StorageError>;

    /// Check if storage is available and accessible
    fn is_available(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Memory Storage Implementation
// ----------------------------------------------------------------------------

/// In-memory storage implementation for testing and fallback
#[derive(Debug)]
pub struct MemoryStorage {
    data: BTreeMap<String, Vec<u8>>,
    available: bool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            available: true,
        }
    }

    /// Storage that refuses every operation, for exercising failure paths
    pub fn unavailable() -> Self {
        Self {
            data: BTreeMap::new(),
            available: false,
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available {
            Ok(())
        } else {
            Err(StorageError::NotAvailable)
        }
    }
}

impl SecureStorage for MemoryStorage {
    fn store(&mut self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.check()?;
        self.data.insert(key.to_string(), data);
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.data.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.data.remove(key);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        self.check()?;
        Ok(self.data.keys().cloned().collect())
    }

    fn clear_all(&mut self) -> Result<(), StorageError> {
        self.check()?;
        self.data.clear();
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

// ----------------------------------------------------------------------------
// File Storage Implementation
// ----------------------------------------------------------------------------

/// Directory-backed storage: one file per key, replaced atomically
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!("Opened file storage at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

impl SecureStorage for FileStorage {
    fn store(&mut self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = self.root.join(format!(".{}.tmp", key));

        // Leftover from an interrupted store
        match fs::remove_file(&tmp) {
            Ok(()) => debug!("Removed stale {}", tmp.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear_all(&mut self) -> Result<(), StorageError> {
        for key in self.list_keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.root.is_dir()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let mut storage = MemoryStorage::new();

        assert!(storage.is_available());

        let key = "test_key";
        let data = vec![1, 2, 3, 4];

        storage.store(key, data.clone()).unwrap();
        assert_eq!(storage.retrieve(key).unwrap().unwrap(), data);

        let keys = storage.list_keys().unwrap();
        assert_eq!(keys, vec![key.to_string()]);

        storage.delete(key).unwrap();
        assert!(storage.retrieve(key).unwrap().is_none());

        storage.store("key1", vec![1]).unwrap();
        storage.store("key2", vec![2]).unwrap();
        storage.clear_all().unwrap();
        assert!(storage.list_keys().unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_memory_storage() {
        let mut storage = MemoryStorage::unavailable();
        assert!(!storage.is_available());
        assert_eq!(
            storage.store("k", vec![1]),
            Err(StorageError::NotAvailable)
        );
        assert_eq!(storage.retrieve("k"), Err(StorageError::NotAvailable));
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path().join("keys")).unwrap();
        assert!(storage.is_available());

        assert!(storage.retrieve("identity.v1").unwrap().is_none());
        storage.store("identity.v1", vec![9, 8, 7]).unwrap();
        storage.store("identity.v1", vec![1, 2]).unwrap();
        assert_eq!(storage.retrieve("identity.v1").unwrap(), Some(vec![1, 2]));
        assert_eq!(storage.list_keys().unwrap(), vec!["identity.v1".to_string()]);

        // A second handle on the same directory sees the data
        let reopened = FileStorage::open(storage.root().to_path_buf()).unwrap();
        assert_eq!(reopened.retrieve("identity.v1").unwrap(), Some(vec![1, 2]));

        storage.delete("identity.v1").unwrap();
        storage.delete("identity.v1").unwrap();
        assert!(storage.list_keys().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_storage_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        storage.store("secret", vec![1]).unwrap();

        let mode = fs::metadata(dir.path().join("secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_temp_file_is_not_reused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        let stale = dir.path().join(".secret.tmp");
        fs::write(&stale, b"old").unwrap();
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o644)).unwrap();

        storage.store("secret", vec![4, 2]).unwrap();

        let stored = dir.path().join("secret");
        let mode = fs::metadata(&stored).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(&stored).unwrap(), vec![4, 2]);
        assert!(!stale.exists());
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        for key in ["../escape", "a/b", "", ".hidden"] {
            assert!(matches!(
                storage.store(key, vec![1]),
                Err(StorageError::InvalidKey(_))
            ));
        }
    }
}
