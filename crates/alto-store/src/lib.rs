//! Storage abstraction for the Alto orchestrator.
//!
//! Provides the [`StorageBackend`] trait the core reads and writes through
//! (artifacts, base catalogs, state documents, reservoir partitions) and a
//! local-directory driver used when no object store is configured. Remote
//! drivers (S3/GCS/Azure) plug in behind the same trait and live outside
//! this workspace.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod local;
pub mod retry;

pub use backend::StorageBackend;
pub use error::{Result, StoreError};
pub use local::LocalBackend;
pub use retry::{with_retries, DEFAULT_MAX_ATTEMPTS};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_is_object_safe() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let _: &dyn StorageBackend = &backend;
    }
}
