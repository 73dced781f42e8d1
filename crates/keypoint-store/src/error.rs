//! Store error types.
//!
//! Every public API in this crate surfaces failures through [`StoreError`].

use std::path::PathBuf;

/// Unified error type for keypoint storage and scope bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller supplied a malformed record or argument (e.g. an empty
    /// `keyId`, an unknown scope name).
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// The backing file exists but does not contain a keypoint array.
    #[error("corrupt keypoint file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the file-backed store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Shorthand for a [`StoreError::Validation`].
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display() {
        let err = StoreError::validation("keyId is required");
        assert_eq!(err.to_string(), "validation failed: keyId is required");
    }

    #[test]
    fn corrupt_display_includes_path() {
        let err = StoreError::Corrupt {
            path: PathBuf::from("/tmp/keys.json"),
            reason: "expected an array".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt keypoint file /tmp/keys.json: expected an array"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
    }
}
