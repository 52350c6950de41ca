//! Plover storage providers.
//!
//! This crate defines the durable key-value persistence contract the rest of
//! Plover builds on, plus two implementations:
//!
//! - [`FileStore`] — one file per key under a root directory, with
//!   write-to-temp-then-atomic-rename replace semantics
//! - [`MemoryStore`] — an in-process map, for tests and embedding
//!
//! ## Design Principles
//!
//! - **Swappable**: sessions and de-identification maps only ever see the
//!   [`StorageProvider`] trait; a flat directory, an embedded database, or a
//!   remote store are interchangeable behind it.
//! - **All-or-nothing writes**: a concurrent reader observes either the
//!   previous document or the new one, never a torn file. `FileStore`
//!   guarantees this by writing to a temporary file in the same directory
//!   and atomically renaming it over the target.
//! - **Scoped keys**: keys are bare file names from a conservative character
//!   set; path separators and dot-prefixed names are rejected at the
//!   boundary so a key can never escape the root directory.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Root directory cannot be used (missing, not a directory, not creatable)
    #[error("Invalid storage root: {0}")]
    InvalidRoot(String),

    /// Key validation failed (potential directory traversal or unsafe name)
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// No entry exists for the requested key
    #[error("No stored entry for key: {0}")]
    KeyNotFound(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable key-value persistence used for sessions and de-identification maps.
///
/// Implementations must make [`save`](StorageProvider::save) atomic with
/// respect to concurrent readers: a `load` racing a `save` returns either
/// the old bytes or the new bytes in full. Keys are validated with
/// [`validate_key`] before any I/O.
pub trait StorageProvider {
    /// Writes `bytes` under `key`, replacing any previous value atomically.
    fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] if no entry exists.
    fn load(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Lists all stored keys in lexicographic order.
    fn list(&self) -> StoreResult<Vec<String>>;

    /// Removes the entry under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] if no entry exists.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Returns true if an entry exists under `key`.
    fn exists(&self, key: &str) -> StoreResult<bool>;
}

/// Validates that `key` is safe to use as a bare file name.
///
/// Accepts 1..=128 characters of `A-Z a-z 0-9 . - _`, not starting with a
/// dot or dash. Rejecting separators here (rather than in each provider)
/// keeps traversal checks in one place.
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] describing the violation.
pub fn validate_key(key: &str) -> StoreResult<()> {
    const MAX_KEY_LEN: usize = 128;

    if key.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key exceeds maximum length of {MAX_KEY_LEN} characters"
        )));
    }

    let mut bytes = key.bytes();
    let first_ok = bytes.next().is_some_and(|b| b.is_ascii_alphanumeric());
    let rest_ok = bytes.all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b'_'));

    if !first_ok || !rest_ok {
        return Err(StoreError::InvalidKey(format!(
            "key must start alphanumeric and contain only [A-Za-z0-9._-], got: '{key}'"
        )));
    }

    Ok(())
}
