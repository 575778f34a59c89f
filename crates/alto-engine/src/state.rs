//! State materialization, STATE folding, and atomic write-back.
//!
//! The active state of a `(tap, target)` pair lives at
//! `state/<env>/<tap>-to-<target>.json` on the storage backend. A pipeline
//! run materializes it into staging for the tap, folds the STATE lines the
//! target emits, and on success rotates the prior document to a timestamped
//! snapshot before atomically writing the new one. A failed run leaves the
//! active state untouched.

use std::fs;
use std::path::PathBuf;

use serde_json::{Map, Value};

use alto_store::{with_retries, StorageBackend, DEFAULT_MAX_ATTEMPTS};
use alto_types::config::deep_merge;
use alto_types::singer::StateMessage;
use alto_types::{AltoError, Result};

use crate::paths::ProjectLayout;

/// Container key some external state managers wrap documents in; unwrapped
/// on materialization.
const STATE_CONTAINER: &str = "singer_state";

/// Accumulates intercepted STATE messages into the next active state.
///
/// Each message's `value` is deep-merged over the running document, so the
/// final document reflects the last STATE per key while tolerating taps
/// that emit partial bookmarks.
#[derive(Debug, Default)]
pub struct StateFold {
    doc: Value,
    observed: bool,
}

impl StateFold {
    /// Start from an existing document (the materialized active state).
    #[must_use]
    pub fn with_base(base: Value) -> Self {
        Self {
            doc: base,
            observed: false,
        }
    }

    /// Fold one intercepted STATE message.
    pub fn observe(&mut self, message: StateMessage) {
        let base = std::mem::take(&mut self.doc);
        self.doc = deep_merge(base, message.value);
        self.observed = true;
    }

    /// The folded document, when at least one STATE was observed.
    #[must_use]
    pub fn finish(self) -> Option<Value> {
        self.observed.then_some(self.doc)
    }
}

/// Read and write side of the per-pair state documents.
pub struct StateStore<'a> {
    store: &'a dyn StorageBackend,
    layout: &'a ProjectLayout,
}

impl<'a> StateStore<'a> {
    #[must_use]
    pub fn new(store: &'a dyn StorageBackend, layout: &'a ProjectLayout) -> Self {
        Self { store, layout }
    }

    /// Load the active state document, unwrapping the `singer_state`
    /// container when present.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::StateCorruption`] when the document exists but
    /// does not parse; an explicit `clean` is the reset path.
    pub fn load_active(&self, tap: &str, target: &str) -> Result<Option<Value>> {
        let key = self.layout.remote_state_key(tap, target);
        let exists = with_retries("state.exists", DEFAULT_MAX_ATTEMPTS, || {
            self.store.exists(&key)
        })?;
        if !exists {
            return Ok(None);
        }
        let bytes = with_retries("state.get", DEFAULT_MAX_ATTEMPTS, || self.store.get(&key))?;
        let mut doc: Value =
            serde_json::from_slice(&bytes).map_err(|err| AltoError::StateCorruption {
                path: PathBuf::from(&key),
                message: err.to_string(),
            })?;
        if let Some(inner) = doc
            .as_object_mut()
            .and_then(|map: &mut Map<String, Value>| map.remove(STATE_CONTAINER))
        {
            doc = inner;
        }
        Ok(Some(doc))
    }

    /// Materialize the active state into staging for the tap's `--state`
    /// flag. Absent state means a full refresh and yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`AltoError::StateCorruption`] on an unparsable document.
    pub fn materialize(&self, tap: &str, target: &str) -> Result<Option<PathBuf>> {
        match self.load_active(tap, target)? {
            None => Ok(None),
            Some(doc) => {
                let path = self.layout.state_path(tap, target)?;
                fs::write(&path, serde_json::to_vec_pretty(&doc)?)?;
                Ok(Some(path))
            }
        }
    }

    /// Persist a new active state: snapshot the prior document under a
    /// UTC `yyyymmddHHMMSS` suffix, then atomically replace the active one.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the snapshot or the write fails.
    pub fn commit(&self, tap: &str, target: &str, new_state: &Value) -> Result<()> {
        let key = self.layout.remote_state_key(tap, target);
        let exists = with_retries("state.exists", DEFAULT_MAX_ATTEMPTS, || {
            self.store.exists(&key)
        })?;
        if exists {
            let prior = with_retries("state.get", DEFAULT_MAX_ATTEMPTS, || self.store.get(&key))?;
            let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
            let snapshot = self
                .layout
                .remote_state_snapshot_key(tap, target, &timestamp);
            with_retries("state.snapshot", DEFAULT_MAX_ATTEMPTS, || {
                self.store.put(&snapshot, &prior)
            })?;
            tracing::debug!(tap, target, snapshot = %snapshot, "Rotated prior active state");
        }
        let bytes = serde_json::to_vec_pretty(new_state)?;
        with_retries("state.put", DEFAULT_MAX_ATTEMPTS, || {
            self.store.put_atomic(&key, &bytes)
        })?;
        tracing::info!(tap, target, "Active state updated");
        Ok(())
    }

    /// Drop the active state of a pair (the `clean` path for
    /// [`AltoError::StateCorruption`]). Historical snapshots are kept.
    ///
    /// # Errors
    ///
    /// Returns a storage error on removal failure.
    pub fn clean(&self, tap: &str, target: &str) -> Result<()> {
        let key = self.layout.remote_state_key(tap, target);
        if self.store.exists(&key)? {
            self.store.remove(&key)?;
        }
        Ok(())
    }
}
