//! Error types for reference resolution.

use thiserror::Error;

use crate::vfs::VfsError;

/// Errors raised while loading, resolving or persisting references.
#[derive(Error, Debug)]
pub enum RefError {
    /// The reference document is malformed. Raised at load time only.
    #[error("invalid reference document: {0}")]
    Specification(String),

    /// No reference (and no synthesized directory) exists at this path.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The reference exists but its target could not be read.
    #[error("reference {path:?} could not reach target {locator}: {source}")]
    TargetUnreachable {
        path: String,
        locator: String,
        #[source]
        source: VfsError,
    },

    /// The locator's protocol has no backend and no default applies.
    #[error("no backend configured for protocol {protocol:?} (reference {path:?})")]
    BackendNotConfigured { path: String, protocol: String },

    /// A template placeholder survived expansion.
    #[error("reference {path:?} has unresolved template {placeholder:?}")]
    UnresolvedTemplate { path: String, placeholder: String },

    /// Encoded or persisted bytes failed to decode.
    #[error("failed to decode {path:?}: {message}")]
    Decode { path: String, message: String },

    /// Reading or writing lazy-mapper storage failed.
    #[error("storage error at {path:?}: {source}")]
    Storage {
        path: String,
        #[source]
        source: VfsError,
    },

    /// An asynchronous-mode filesystem was handed to the blocking facade.
    #[error("filesystem was configured as asynchronous; use the async API")]
    AsynchronousMode,

    /// Backend error outside reference dereferencing (put/get, save).
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefError {
    /// Create a Specification error.
    pub fn spec(msg: impl Into<String>) -> Self {
        Self::Specification(msg.into())
    }

    /// Create a KeyNotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::KeyNotFound(path.into())
    }

    /// Create a Decode error.
    pub fn decode(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create a Storage error.
    pub fn storage(path: impl Into<String>, source: VfsError) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// The logical path the error is about, when there is one.
    pub fn path(&self) -> Option<&str> {
        match self {
            RefError::KeyNotFound(path)
            | RefError::TargetUnreachable { path, .. }
            | RefError::BackendNotConfigured { path, .. }
            | RefError::UnresolvedTemplate { path, .. }
            | RefError::Decode { path, .. }
            | RefError::Storage { path, .. } => Some(path),
            _ => None,
        }
    }

    /// True for [`RefError::KeyNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, RefError::KeyNotFound(_))
    }
}

/// Result type for reference operations.
pub type RefResult<T> = Result<T, RefError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_unreachable_message_names_path_and_locator() {
        let err = RefError::TargetUnreachable {
            path: "d".into(),
            locator: "memory://unknown".into(),
            source: VfsError::not_found("unknown"),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"d\""));
        assert!(msg.contains("//unknown"));
        assert!(err.source().is_some());
        assert_eq!(err.path(), Some("d"));
    }

    #[test]
    fn test_spec_error_has_no_path() {
        let err = RefError::spec("bad gen");
        assert!(err.path().is_none());
        assert!(!err.is_not_found());
    }
}
