//! Storage error types.

/// Errors produced by [`StorageBackend`](crate::StorageBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The key escapes the backend root or is otherwise malformed.
    #[error("invalid object key `{key}`: {message}")]
    InvalidKey { key: String, message: String },

    /// Underlying I/O failure. May be transient for remote drivers; the
    /// caller decides whether to retry via [`StoreError::is_transient`].
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient driver failure worth retrying (throttling, connection
    /// reset). The local driver never produces this.
    #[error("transient storage error: {0}")]
    Transient(String),
}

impl StoreError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for alto_types::AltoError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(message) => Self::RemoteUnavailable(message),
            StoreError::Io(io) => Self::Io(io),
            other => Self::RemoteUnavailable(other.to_string()),
        }
    }
}
