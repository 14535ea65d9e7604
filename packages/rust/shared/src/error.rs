//! Error types for ctirelay.
//!
//! Library crates use [`CtiRelayError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ctirelay operations.
#[derive(Debug, thiserror::Error)]
pub enum CtiRelayError {
    /// Configuration loading or validation error. Fatal at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Queue store error that is not a plain I/O failure (lock, key).
    #[error("queue error: {0}")]
    Queue(String),

    /// Producer input or identifier rejected before touching storage.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The downstream sink refused or failed a dispatch.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// A bounded external call did not complete in time.
    #[error("timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CtiRelayError>;

impl CtiRelayError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should abort only the current polling cycle
    /// (as opposed to refusing to start).
    pub fn is_cycle_abort(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Queue(_) | Self::Dispatch(_) | Self::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for CtiRelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
