//! Error types for Gapwise.
//!
//! Library crates use [`GapwiseError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Gapwise operations.
#[derive(Debug, thiserror::Error)]
pub enum GapwiseError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a completion provider or research source.
    #[error("network error: {0}")]
    Network(String),

    /// Response or document parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Completion provider error (API failure, empty choice list, etc.).
    #[error("completion error: {0}")]
    Completion(String),

    /// Research backend error.
    #[error("research error: {0}")]
    Research(String),

    /// Specialist dispatch error.
    #[error("specialist error: {0}")]
    Specialist(String),

    /// An operation exceeded its time budget.
    #[error("timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid knowledge unit, bad weights, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GapwiseError>;

impl GapwiseError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: duration.as_millis() as u64,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
