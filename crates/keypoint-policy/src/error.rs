//! Error types for the policy crate.
//!
//! [`AuthzError`] mirrors the three failure classes callers map onto
//! transport responses: authentication (401), authorization (403) and
//! malformed input (400). Rule denials are *not* errors; only
//! [`AuthzError::Policy`] wraps one when the caller asked for enforcement.

use keypoint_store::StoreError;

use crate::decision::AccessDecision;

/// Why keypoint validation failed.
///
/// [`KeypointFailure::Invalid`] and [`KeypointFailure::SecretMismatch`]
/// render the same message so callers cannot probe which key ids exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypointFailure {
    /// Neither the id header nor the query parameter was present.
    Missing,
    /// No keypoint with the presented id.
    Invalid,
    /// The keypoint exists but has expired.
    Expired,
    /// The keypoint exists but the presented secret is wrong.
    SecretMismatch,
}

impl KeypointFailure {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::SecretMismatch => "secret_mismatch",
        }
    }
}

impl std::fmt::Display for KeypointFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Missing => "keypoint header required",
            Self::Invalid | Self::SecretMismatch => "invalid keypoint",
            Self::Expired => "keypoint expired",
        })
    }
}

/// Unified error type for validation, evaluation and configuration.
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    /// Authentication failed.
    #[error("{failure}")]
    Keypoint { failure: KeypointFailure },

    /// Authorization was denied; carries the full decision.
    #[error("access denied: {reason}")]
    Policy {
        reason: String,
        decision: Box<AccessDecision>,
    },

    /// Malformed input.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// An error propagated from the keypoint store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AuthzError {
    pub fn keypoint(failure: KeypointFailure) -> Self {
        Self::Keypoint { failure }
    }

    /// Wrap a denying decision.
    pub fn policy(decision: AccessDecision) -> Self {
        Self::Policy {
            reason: decision.reason.clone(),
            decision: Box::new(decision),
        }
    }

    /// HTTP-style status code for transport layers.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Keypoint { .. } => 401,
            Self::Policy { .. } => 403,
            Self::Validation { .. } | Self::Store(StoreError::Validation { .. }) => 400,
            Self::Config { .. } | Self::Store(_) => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Keypoint { .. } => "KEYPOINT_ERROR",
            Self::Policy { .. } => "POLICY_ERROR",
            Self::Validation { .. } | Self::Store(StoreError::Validation { .. }) => {
                "VALIDATION_ERROR"
            }
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// The denying decision, if this is an authorization failure.
    pub fn decision(&self) -> Option<&AccessDecision> {
        match self {
            Self::Policy { decision, .. } => Some(decision.as_ref()),
            _ => None,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthzError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoint_messages() {
        assert_eq!(
            AuthzError::keypoint(KeypointFailure::Missing).to_string(),
            "keypoint header required"
        );
        assert_eq!(
            AuthzError::keypoint(KeypointFailure::Expired).to_string(),
            "keypoint expired"
        );
    }

    #[test]
    fn unknown_id_and_wrong_secret_read_the_same() {
        assert_eq!(
            AuthzError::keypoint(KeypointFailure::Invalid).to_string(),
            AuthzError::keypoint(KeypointFailure::SecretMismatch).to_string()
        );
        assert_ne!(
            KeypointFailure::Invalid.as_str(),
            KeypointFailure::SecretMismatch.as_str()
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(AuthzError::keypoint(KeypointFailure::Invalid).status_code(), 401);
        assert_eq!(
            AuthzError::policy(AccessDecision::deny("nope")).status_code(),
            403
        );
        assert_eq!(
            AuthzError::Validation {
                reason: "bad".into()
            }
            .status_code(),
            400
        );
        assert_eq!(
            AuthzError::from(StoreError::validation("keyId is required")).status_code(),
            400
        );
        assert_eq!(
            AuthzError::from(StoreError::Io(std::io::Error::other("disk"))).status_code(),
            500
        );
    }

    #[test]
    fn policy_error_carries_decision() {
        let err = AuthzError::policy(AccessDecision::deny("IP blocked"));
        assert_eq!(err.to_string(), "access denied: IP blocked");
        assert_eq!(err.error_code(), "POLICY_ERROR");
        assert!(!err.decision().unwrap().allowed);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthzError>();
    }
}
