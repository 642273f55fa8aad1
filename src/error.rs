//! Error types for the protocol watcher.
//!
//! Per-event errors are caught at the engine boundary and logged; only
//! [`ConfigError`] is allowed to stop the whole engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while handling a single file-system event.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error while {operation} {}: {source}", path.display())]
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    #[error(
        "Mirror copy of {} diverges from {} after {attempts} attempts",
        source_path.display(),
        mirror_path.display()
    )]
    MirrorDivergence {
        source_path: PathBuf,
        mirror_path: PathBuf,
        attempts: u32,
    },

    #[error("Unreadable image {}: {reason}", path.display())]
    CorruptImage { path: PathBuf, reason: String },

    #[error("Remote protocol entry is read-only, refusing to modify it for {}", path.display())]
    ReadOnlyEntry { path: PathBuf },

    #[error("Sample '{name}' cannot be removed while it still owns resources")]
    SampleNotEmpty { name: String },

    #[error("Element type {element} is already registered")]
    AlreadyRegistered { element: String },

    #[error("Element type {element} is not registered")]
    NotRegistered { element: String },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Failed to publish protocol: {reason}")]
    Publish { reason: String },

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Build an [`EngineError::Io`] with the operation and path that failed.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Whether repeating the failed operation can change its outcome.
    ///
    /// Read-only entries and configuration problems are permanent; everything
    /// else (locked files, half-written images, transient publish failures)
    /// is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::ReadOnlyEntry { .. }
                | EngineError::Config(_)
                | EngineError::Pattern(_)
                | EngineError::AlreadyRegistered { .. }
                | EngineError::NotRegistered { .. }
        )
    }
}

/// Fatal, construction-time configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration parameter '{parameter}'")]
    MissingParameter { parameter: String },

    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue { parameter: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_is_not_retryable() {
        let err = EngineError::ReadOnlyEntry {
            path: PathBuf::from("/root/S1/img.tif"),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let io = EngineError::io(
            "copying",
            "/root/a.tif",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
        );
        assert!(io.is_retryable());

        let corrupt = EngineError::CorruptImage {
            path: PathBuf::from("/root/a.tif"),
            reason: "truncated".to_string(),
        };
        assert!(corrupt.is_retryable());
    }

    #[test]
    fn test_io_error_message_has_context() {
        let err = EngineError::io(
            "copying",
            "/root/S1/img.tif",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let message = err.to_string();
        assert!(message.contains("copying"));
        assert!(message.contains("/root/S1/img.tif"));
    }
}
