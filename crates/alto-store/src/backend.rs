//! Storage backend trait definition.

use std::io::{Read, Write};
use std::time::SystemTime;

use crate::error::Result;

/// Storage contract the orchestrator core persists through.
///
/// Keys are `/`-separated paths relative to the backend root (e.g.
/// `plugins/<fingerprint>`, `state/dev/tap-x-to-target-y.json`). A single
/// handle is shared process-wide: implementations must be `Send + Sync` and
/// safe for concurrent reads; callers serialize writes per key.
pub trait StorageBackend: Send + Sync {
    /// Whether an object exists at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Read the full object at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) when
    /// absent, or another [`StoreError`](crate::StoreError) on failure.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Write the full object at `key`, creating parent prefixes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Write `key` so readers observe either the old or the new object,
    /// never a partial one (write-to-temp then rename, or the driver's
    /// native atomic upload).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Keys under `prefix`, sorted lexicographically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure; a
    /// missing prefix yields an empty listing.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove the object at `key`. Removing an absent key is an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn remove(&self, key: &str) -> Result<()>;

    /// Streaming read handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn open_read(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Streaming write handle; contents become visible on drop/flush.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn open_write(&self, key: &str) -> Result<Box<dyn Write + Send>>;

    /// Last-modified time of the object at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::StoreError) on storage failure.
    fn mtime(&self, key: &str) -> Result<SystemTime>;
}
