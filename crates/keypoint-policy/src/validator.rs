//! Keypoint validation: the authentication boundary.
//!
//! [`KeypointValidator::validate`] either attaches a fully validated
//! keypoint to the request context or fails with [`AuthzError::Keypoint`].
//! Everything downstream trusts `ctx.keypoint`.

use std::sync::Arc;

use keypoint_store::KeypointStore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::clock::{SharedClock, system_clock};
use crate::context::RequestContext;
use crate::error::{AuthzError, KeypointFailure, Result};

/// Where credentials are read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Header carrying the key id.
    pub id_header: String,
    /// Header carrying the shared secret.
    pub secret_header: String,
    /// Query parameter consulted when the id header is absent.
    pub query_param: String,
    /// Reject requests that present no secret.
    pub require_secret: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            id_header: "x-keypoint-id".into(),
            secret_header: "x-keypoint-secret".into(),
            query_param: "keypointId".into(),
            require_secret: false,
        }
    }
}

/// Resolves and checks the caller's keypoint against a store.
#[derive(Clone)]
pub struct KeypointValidator {
    store: Arc<dyn KeypointStore>,
    config: ValidatorConfig,
    clock: SharedClock,
}

impl KeypointValidator {
    pub fn new(store: Arc<dyn KeypointStore>) -> Self {
        Self {
            store,
            config: ValidatorConfig::default(),
            clock: system_clock(),
        }
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// The presented key id: header first, then the query parameter.
    pub fn extract_key_id<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        ctx.header(&self.config.id_header)
            .or_else(|| ctx.query_param(&self.config.query_param))
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Validate the request's credentials and attach the keypoint.
    ///
    /// Steps run in order: extract id, look up, check expiry, compare the
    /// secret (when presented or required), attach.
    ///
    /// # Errors
    ///
    /// [`AuthzError::Keypoint`] for any authentication failure and
    /// [`AuthzError::Store`] if the lookup itself fails.
    pub async fn validate(&self, ctx: &mut RequestContext) -> Result<bool> {
        let Some(key_id) = self.extract_key_id(ctx).map(str::to_string) else {
            return Err(self.reject(KeypointFailure::Missing, None));
        };

        let Some(keypoint) = self.store.get(&key_id).await? else {
            return Err(self.reject(KeypointFailure::Invalid, Some(&key_id)));
        };

        if keypoint.is_expired_at(self.clock.now()) {
            return Err(self.reject(KeypointFailure::Expired, Some(&key_id)));
        }

        match ctx.header(&self.config.secret_header) {
            Some(presented) => {
                if !secrets_match(presented, &keypoint.secret) {
                    return Err(self.reject(KeypointFailure::SecretMismatch, Some(&key_id)));
                }
            }
            None if self.config.require_secret => {
                return Err(self.reject(KeypointFailure::Missing, Some(&key_id)));
            }
            None => {}
        }

        tracing::debug!(key_id = %key_id, "keypoint validated");
        ctx.attach_keypoint(keypoint);
        Ok(true)
    }

    fn reject(&self, failure: KeypointFailure, key_id: Option<&str>) -> AuthzError {
        tracing::warn!(
            failure = failure.as_str(),
            key_id = key_id.unwrap_or("-"),
            "keypoint validation failed"
        );
        AuthzError::keypoint(failure)
    }
}

impl std::fmt::Debug for KeypointValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypointValidator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Constant-time comparison of two secrets.
fn secrets_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use keypoint_store::{Keypoint, MemoryKeypointStore};

    use super::*;
    use crate::clock::ManualClock;

    async fn validator() -> (KeypointValidator, ManualClock) {
        let store = MemoryKeypointStore::new();
        let now = Utc::now();
        store
            .set(Keypoint::new("k1", "s1").with_scopes(["read"]))
            .await
            .unwrap();
        store
            .set(Keypoint::new("old", "s2").with_expires_at(now + Duration::hours(1)))
            .await
            .unwrap();
        let clock = ManualClock::new(now);
        let validator =
            KeypointValidator::new(Arc::new(store)).with_clock(Arc::new(clock.clone()));
        (validator, clock)
    }

    fn failure(err: AuthzError) -> KeypointFailure {
        match err {
            AuthzError::Keypoint { failure } => failure,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn header_and_secret() {
        let (validator, _) = validator().await;
        let mut ctx = RequestContext::new("GET", "/")
            .with_header("X-Keypoint-Id", "k1")
            .with_header("X-Keypoint-Secret", "s1");

        assert!(validator.validate(&mut ctx).await.unwrap());
        assert_eq!(ctx.keypoint().unwrap().key_id, "k1");
    }

    #[tokio::test]
    async fn query_fallback_without_secret() {
        let (validator, _) = validator().await;
        let mut ctx = RequestContext::new("GET", "/items?keypointId=k1");
        assert!(validator.validate(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn missing_id() {
        let (validator, _) = validator().await;
        let mut ctx = RequestContext::new("GET", "/");
        let err = validator.validate(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "keypoint header required");
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn unknown_id_and_wrong_secret_look_alike() {
        let (validator, _) = validator().await;

        let mut unknown = RequestContext::new("GET", "/").with_header("x-keypoint-id", "nope");
        let unknown_err = validator.validate(&mut unknown).await.unwrap_err();

        let mut wrong = RequestContext::new("GET", "/")
            .with_header("x-keypoint-id", "k1")
            .with_header("x-keypoint-secret", "guess");
        let wrong_err = validator.validate(&mut wrong).await.unwrap_err();

        assert_eq!(unknown_err.to_string(), wrong_err.to_string());
        assert_eq!(failure(unknown_err), KeypointFailure::Invalid);
        assert_eq!(failure(wrong_err), KeypointFailure::SecretMismatch);
        assert!(wrong.keypoint().is_none());
    }

    #[tokio::test]
    async fn wrong_secret_is_logged_as_mismatch() {
        let (validator, _) = validator().await;
        let mut ctx = RequestContext::new("GET", "/")
            .with_header("x-keypoint-id", "k1")
            .with_header("x-keypoint-secret", "s2");

        let err = validator.validate(&mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.to_string(), "invalid keypoint");

        let kind = failure(err);
        assert_eq!(kind, KeypointFailure::SecretMismatch);
        assert_eq!(kind.as_str(), "secret_mismatch");
    }

    #[tokio::test]
    async fn expiry_follows_clock() {
        let (validator, clock) = validator().await;
        let mut ctx = RequestContext::new("GET", "/").with_header("x-keypoint-id", "old");
        assert!(validator.validate(&mut ctx).await.unwrap());

        clock.advance(Duration::hours(2));
        let mut ctx = RequestContext::new("GET", "/").with_header("x-keypoint-id", "old");
        let err = validator.validate(&mut ctx).await.unwrap_err();
        assert_eq!(failure(err), KeypointFailure::Expired);
    }

    #[tokio::test]
    async fn require_secret() {
        let (validator, _) = validator().await;
        let validator = validator.with_config(ValidatorConfig {
            require_secret: true,
            ..ValidatorConfig::default()
        });
        let mut ctx = RequestContext::new("GET", "/").with_header("x-keypoint-id", "k1");
        let err = validator.validate(&mut ctx).await.unwrap_err();
        assert_eq!(failure(err), KeypointFailure::Missing);
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cre"));
        assert!(!secrets_match("", "x"));
    }
}
