//! File-system storage provider.
//!
//! One file per key, directly under a root directory. Writes go to a
//! temporary file in the same directory and are atomically renamed over the
//! target, so concurrent invocations of the CLI never observe a partially
//! written document: a racing reader sees the previous file or the new one,
//! nothing in between. Failed writes leave the previous file untouched.

use crate::{validate_key, StorageProvider, StoreError, StoreResult};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Storage provider keeping one file per key under a root directory.
///
/// The root is created if missing and canonicalised once at construction;
/// every subsequent operation is a single file access inside it. The
/// provider is stateless beyond the root path, so it is safe to construct
/// independently in concurrent processes pointed at the same directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if necessary) a file store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidRoot` if the path exists but is not a
    /// directory, cannot be created, or cannot be canonicalised.
    pub fn open(root: &Path) -> StoreResult<Self> {
        if !root.exists() {
            fs::create_dir_all(root).map_err(|e| {
                StoreError::InvalidRoot(format!(
                    "cannot create storage root {}: {}",
                    root.display(),
                    e
                ))
            })?;
        }

        if !root.is_dir() {
            return Err(StoreError::InvalidRoot(format!(
                "path is not a directory: {}",
                root.display()
            )));
        }

        let root = root.canonicalize().map_err(|e| {
            StoreError::InvalidRoot(format!(
                "cannot canonicalize path {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Self { root })
    }

    /// Returns the canonicalised root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl StorageProvider for FileStore {
    fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let target = self.entry_path(key)?;

        // Temp file must live in the same directory as the target so the
        // rename stays on one filesystem and remains atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| StoreError::Io(e.error))?;

        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Vec<u8>> {
        let target = self.entry_path(key)?;
        match fs::read(&target) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::KeyNotFound(key.to_owned()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Skip anything a key could not have named (editor swap
                // files, in-flight temp files).
                if validate_key(name).is_ok() {
                    keys.push(name.to_owned());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let target = self.entry_path(key)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::KeyNotFound(key.to_owned()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entry_path(key)?.is_file())
    }
}
