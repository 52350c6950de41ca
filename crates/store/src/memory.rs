//! In-memory storage provider.
//!
//! Backs tests and embedded use where durability is not wanted. Semantics
//! mirror [`FileStore`](crate::FileStore): the same key validation, the same
//! not-found behaviour, and whole-value replacement on save (a reader sees
//! the old bytes or the new bytes, never a mixture).

use crate::{validate_key, StorageProvider, StoreError, StoreResult};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Storage provider keeping entries in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries.lock().map_err(|_| {
            StoreError::Io(std::io::Error::other("memory store mutex poisoned"))
        })
    }
}

impl StorageProvider for MemoryStore {
    fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        self.lock()?.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Vec<u8>> {
        validate_key(key)?;
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound(key.to_owned()))
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.lock()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::KeyNotFound(key.to_owned()))
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        validate_key(key)?;
        Ok(self.lock()?.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_delete_round_trip() {
        let store = MemoryStore::new();
        store.save("demo.yaml", b"payload").unwrap();
        assert!(store.exists("demo.yaml").unwrap());
        assert_eq!(store.load("demo.yaml").unwrap(), b"payload");

        store.delete("demo.yaml").unwrap();
        assert!(!store.exists("demo.yaml").unwrap());
        assert!(matches!(
            store.load("demo.yaml"),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn list_is_sorted() {
        let store = MemoryStore::new();
        store.save("b.yaml", b"2").unwrap();
        store.save("a.yaml", b"1").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a.yaml", "b.yaml"]);
    }

    #[test]
    fn rejects_invalid_keys() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.save("../escape", b"x"),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
