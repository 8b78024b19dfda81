//! Persistent storage using sled
//!
//! Components never talk to sled directly; they take a [`Persistence`]
//! handle so tests and simulations can swap in [`MemoryStore`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Key/value persistence capability.
pub trait Persistence: Send + Sync {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the value stored under `key`.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Flush all pending writes
    fn flush(&self) -> Result<(), StorageError>;
}

/// Sled-backed persistence for the node.
pub struct SledStore {
    db: sled::Db,
    /// Snapshot tree: component key -> postcard blob
    snapshots: sled::Tree,
}

impl SledStore {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let snapshots = db.open_tree("snapshots")?;
        Ok(Self { db, snapshots })
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl Persistence for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.snapshots.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.snapshots.insert(key, value)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Volatile persistence for tests and in-process simulation.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sled_put_get() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        assert!(store.get("ledger").unwrap().is_none());
        store.put("ledger", b"snapshot-1").unwrap();
        store.put("ledger", b"snapshot-2").unwrap();
        assert_eq!(store.get("ledger").unwrap().unwrap(), b"snapshot-2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sled_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put("ledger", &[1, 2, 3]).unwrap();
            store.flush().unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get("ledger").unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.put("a", b"x").unwrap();
        assert_eq!(store.get("a").unwrap().unwrap(), b"x");
        assert!(store.get("b").unwrap().is_none());
    }
}
