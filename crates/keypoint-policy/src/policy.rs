//! Named policies referenced from keypoint metadata.
//!
//! A keypoint whose `metadata.policy` names a registered policy gets that
//! policy's verdict once every generic rule has passed.

use async_trait::async_trait;
use keypoint_store::ScopeRegistry;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::decision::PolicyOutcome;

/// A typed policy looked up by name.
#[async_trait]
pub trait NamedPolicy: Send + Sync {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<PolicyOutcome>;
}

/// Requirements checked by [`AllowPolicy`]. Unset fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowPolicyConfig {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Checks scope, then method (exact), then protocol; denies on the first
/// failure.
#[derive(Debug, Clone)]
pub struct AllowPolicy {
    config: AllowPolicyConfig,
    registry: ScopeRegistry,
}

impl AllowPolicy {
    pub fn new(config: AllowPolicyConfig, registry: ScopeRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &AllowPolicyConfig {
        &self.config
    }

    fn check(&self, ctx: &RequestContext) -> PolicyOutcome {
        if let Some(scope) = &self.config.scope {
            if !ctx.has_scope(&self.registry, scope) {
                return PolicyOutcome::deny(format!("Policy requires scope: {scope}"));
            }
        }

        if let Some(method) = &self.config.method {
            if ctx.method != *method {
                return PolicyOutcome::deny(format!("Policy requires method: {method}"));
            }
        }

        if let Some(protocol) = &self.config.protocol {
            let permitted = ctx
                .keypoint()
                .is_some_and(|kp| kp.validate_protocol(protocol));
            if !permitted {
                return PolicyOutcome::deny(format!("Policy requires protocol: {protocol}"));
            }
        }

        PolicyOutcome::allow("Policy allowed")
    }
}

#[async_trait]
impl NamedPolicy for AllowPolicy {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<PolicyOutcome> {
        Ok(self.check(ctx))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keypoint_store::Keypoint;

    use super::*;

    fn policy(scope: Option<&str>, method: Option<&str>, protocol: Option<&str>) -> AllowPolicy {
        AllowPolicy::new(
            AllowPolicyConfig {
                scope: scope.map(String::from),
                method: method.map(String::from),
                protocol: protocol.map(String::from),
            },
            ScopeRegistry::with_defaults(),
        )
    }

    fn ctx(method: &str, kp: Keypoint) -> RequestContext {
        RequestContext::new(method, "/").with_keypoint(kp)
    }

    #[tokio::test]
    async fn checks_run_in_order() {
        let p = policy(Some("write"), Some("POST"), Some("https"));
        let kp = Keypoint::new("k1", "s1")
            .with_scopes(["read"])
            .with_protocols(["http"]);

        // Scope fails first even though method and protocol also fail.
        let outcome = p.evaluate(&ctx("GET", kp.clone())).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.reason, "Policy requires scope: write");

        let kp = kp.with_scopes(["admin"]);
        let outcome = p.evaluate(&ctx("GET", kp.clone())).await.unwrap();
        assert_eq!(outcome.reason, "Policy requires method: POST");

        let outcome = p.evaluate(&ctx("POST", kp.clone())).await.unwrap();
        assert_eq!(outcome.reason, "Policy requires protocol: https");

        let kp = kp.with_protocols(["https"]);
        let outcome = p.evaluate(&ctx("POST", kp)).await.unwrap();
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn method_match_is_exact() {
        let p = policy(None, Some("POST"), None);
        let outcome = p
            .evaluate(&ctx("post", Keypoint::new("k1", "s1")))
            .await
            .unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn empty_config_allows() {
        let p = policy(None, None, None);
        let outcome = p
            .evaluate(&ctx("DELETE", Keypoint::new("k1", "s1")))
            .await
            .unwrap();
        assert!(outcome.allowed);
    }
}
