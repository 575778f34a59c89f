//! Local-directory storage driver.
//!
//! Used when no object store is configured: objects live under a root
//! directory (conventionally `~/.alto/<project>`), keys map to relative
//! paths, and atomic writes go through a sibling temp file plus rename.

use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::backend::StorageBackend;
use crate::error::{Result, StoreError};

/// Filesystem-backed [`StorageBackend`] rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open (and create) a backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The backing directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the root, rejecting traversal outside it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|component| {
            matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        });
        if key.is_empty() || escapes {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                message: "key must be a relative path inside the store root".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(key)?.exists())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        Self::ensure_parent(&path)?;
        fs::write(&path, bytes)?;
        Ok(())
    }

    fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        Self::ensure_parent(&path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::InvalidKey {
                key: key.to_string(),
                message: "key has no file name".to_string(),
            })?;
        let tmp = path.with_file_name(format!("{file_name}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    keys.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn open_read(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(key)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn open_write(&self, key: &str) -> Result<Box<dyn Write + Send>> {
        let path = self.resolve(key)?;
        Self::ensure_parent(&path)?;
        Ok(Box::new(fs::File::create(&path)?))
    }

    fn mtime(&self, key: &str) -> Result<SystemTime> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.modified()?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
