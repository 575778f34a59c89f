//! Error taxonomy for the orchestrator core.

use std::path::PathBuf;

/// Categorized orchestrator error.
///
/// Every failure the core surfaces falls into one of these buckets; the
/// task engine records the failing task and aborts everything downstream
/// of it. Only [`AltoError::RemoteUnavailable`] is retryable.
#[derive(Debug, thiserror::Error)]
pub enum AltoError {
    /// Invalid reference, unresolvable inheritance, or missing required
    /// field. Carries a pointer to the offending key path.
    #[error("config error at `{key_path}`: {message}")]
    Config { key_path: String, message: String },

    /// Plugin install/package step exited non-zero.
    #[error("build failed for plugin `{plugin}`: {message}")]
    Build {
        plugin: String,
        message: String,
        /// Captured installer output, preserved for the operator.
        log: String,
    },

    /// Discovery process exited non-zero or produced no output. The base
    /// catalog cache is not written when this is raised.
    #[error("discovery failed for tap `{tap}`: {message}")]
    Discovery { tap: String, message: String },

    /// Tap, target, or transformer exited non-zero, or the pipe broke.
    /// Active state is not updated when this is raised.
    #[error("pipeline `{pipeline}` failed: {message}")]
    Pipeline {
        pipeline: String,
        message: String,
        /// Exit code of the failing process, when one exists.
        exit_code: Option<i32>,
    },

    /// Active state exists but does not parse. Requires an explicit
    /// `clean` to reset.
    #[error("state file {path} is corrupt: {message}")]
    StateCorruption { path: PathBuf, message: String },

    /// Transient remote-storage failure, surfaced after bounded retries.
    #[error("remote storage unavailable: {0}")]
    RemoteUnavailable(String),

    /// Local filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted document failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AltoError {
    /// Shorthand for a [`AltoError::Config`] with a formatted key path.
    pub fn config(key_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key_path: key_path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` when the engine may retry the failing operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, AltoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_key_path() {
        let err = AltoError::config("taps.tap-x.inherit_from", "plugin not found");
        let msg = err.to_string();
        assert!(msg.contains("taps.tap-x.inherit_from"), "got: {msg}");
        assert!(msg.contains("plugin not found"));
    }

    #[test]
    fn only_remote_unavailable_is_retryable() {
        assert!(AltoError::RemoteUnavailable("timeout".into()).is_retryable());
        assert!(!AltoError::config("k", "m").is_retryable());
        assert!(!AltoError::Discovery {
            tap: "tap-x".into(),
            message: "exit 1".into()
        }
        .is_retryable());
    }

    #[test]
    fn pipeline_error_carries_exit_code() {
        let err = AltoError::Pipeline {
            pipeline: "tap-x:target-y".into(),
            message: "tap exited non-zero".into(),
            exit_code: Some(3),
        };
        assert!(err.to_string().contains("tap-x:target-y"));
    }
}
