//! The policy engine.
//!
//! Rules run strictly in registration order. [`PolicyEngine::evaluate`]
//! stops at the first denial and returns the lightweight
//! [`PolicyOutcome`]; [`PolicyEngine::evaluate_all`] runs every rule and
//! builds a full [`AccessDecision`] for audit.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::clock::{SharedClock, system_clock};
use crate::context::RequestContext;
use crate::decision::{AccessDecision, PolicyOutcome, RuleRecord};
use crate::error::Result;
use crate::policy::NamedPolicy;
use crate::rule::PolicyRule;

/// Prefix for the record a named policy contributes to a decision.
pub const POLICY_RECORD_PREFIX: &str = "policy:";

/// Ordered rule chain plus the named-policy table.
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    policies: HashMap<String, Arc<dyn NamedPolicy>>,
    rule_timeout: Option<Duration>,
    clock: SharedClock,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            policies: HashMap::new(),
            rule_timeout: None,
            clock: system_clock(),
        }
    }

    /// Deny any rule that runs longer than `timeout`.
    pub fn with_rule_timeout(mut self, timeout: Duration) -> Self {
        self.rule_timeout = Some(timeout);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Append a rule. Registration order is evaluation order.
    pub fn add_rule(&mut self, rule: PolicyRule) {
        if self.rules.iter().any(|r| r.name == rule.name) {
            tracing::debug!(rule = %rule.name, "rule name already registered");
        }
        tracing::info!(
            rule = %rule.name,
            priority = rule.priority,
            enabled = rule.enabled,
            "rule registered"
        );
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Register (or replace) a named policy.
    pub fn register_policy(
        &mut self,
        name: impl Into<String>,
        policy: impl NamedPolicy + 'static,
    ) {
        let name = name.into();
        tracing::info!(policy = %name, "policy registered");
        self.policies.insert(name, Arc::new(policy));
    }

    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    /// Names of the registered policies, sorted.
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Short-circuiting evaluation.
    ///
    /// Returns the first denying rule's reason and metadata; later rules do
    /// not run. When every rule passes, a named policy referenced by the
    /// attached keypoint decides; otherwise the request is allowed.
    pub async fn evaluate(&self, ctx: &RequestContext) -> PolicyOutcome {
        for rule in &self.rules {
            let record = rule.evaluate(ctx, self.rule_timeout, self.clock.now()).await;
            if !record.allowed {
                tracing::debug!(rule = %record.rule, reason = %record.reason, "request denied");
                return PolicyOutcome {
                    allowed: false,
                    reason: record.reason,
                    metadata: record.metadata,
                };
            }
        }

        match self.named_policy(ctx).await {
            Some((_, outcome)) => outcome,
            None => PolicyOutcome::allow("All rules passed"),
        }
    }

    /// Evaluate every rule and fold the results into a decision.
    ///
    /// The named policy, if any, is recorded as `policy:<name>` after the
    /// generic rules and only runs when they all passed.
    pub async fn evaluate_all(&self, ctx: &RequestContext) -> AccessDecision {
        let mut decision = AccessDecision::allow("All rules passed")
            .at(self.clock.now())
            .with_metadata("method", ctx.method.clone())
            .with_metadata("path", ctx.path.clone());
        if let Some(kp) = ctx.keypoint() {
            decision = decision.with_metadata("keyId", kp.key_id.clone());
        }

        for rule in &self.rules {
            let record = rule.evaluate(ctx, self.rule_timeout, self.clock.now()).await;
            decision.record(record);
        }

        if decision.allowed {
            if let Some((name, outcome)) = self.named_policy(ctx).await {
                if outcome.allowed {
                    decision.reason = outcome.reason.clone();
                }
                decision.record(RuleRecord {
                    rule: format!("{POLICY_RECORD_PREFIX}{name}"),
                    allowed: outcome.allowed,
                    reason: outcome.reason,
                    timestamp: self.clock.now(),
                    metadata: outcome.metadata,
                });
            }
        }

        tracing::debug!(
            decision_id = %decision.id,
            allowed = decision.allowed,
            rules = decision.evaluated_rules.len(),
            "decision made"
        );
        decision
    }

    /// [`evaluate_all`](Self::evaluate_all), raising a denial as
    /// [`AuthzError::Policy`](crate::AuthzError::Policy).
    pub async fn enforce(&self, ctx: &RequestContext) -> Result<AccessDecision> {
        self.evaluate_all(ctx).await.into_result()
    }

    /// Run the policy named in the keypoint's metadata.
    ///
    /// Returns `None` when no keypoint is attached or it names no policy. An
    /// unregistered name denies.
    async fn named_policy(&self, ctx: &RequestContext) -> Option<(String, PolicyOutcome)> {
        let name = ctx.keypoint()?.policy_name()?.to_string();

        let Some(policy) = self.policies.get(&name) else {
            tracing::warn!(policy = %name, "keypoint references unknown policy");
            let outcome = PolicyOutcome::deny(format!("Unknown policy: {name}"));
            return Some((name, outcome));
        };

        let outcome = match AssertUnwindSafe(policy.evaluate(ctx)).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(policy = %name, error = %e, "policy evaluation failed");
                PolicyOutcome::deny(format!("Policy evaluation failed: {e}"))
            }
            Err(_) => {
                tracing::warn!(policy = %name, "policy evaluation panicked");
                PolicyOutcome::deny("Policy evaluation failed: panic")
            }
        };
        Some((name, outcome))
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("rules", &self.rules)
            .field("policies", &self.policy_names())
            .field("rule_timeout", &self.rule_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keypoint_store::{Keypoint, ScopeRegistry};

    use super::*;
    use crate::policy::{AllowPolicy, AllowPolicyConfig};
    use crate::rule::RuleOutcome;

    fn allow(name: &str) -> PolicyRule {
        PolicyRule::from_fn(name, |_| Ok(RuleOutcome::allow()))
    }

    fn deny(name: &str, reason: &'static str) -> PolicyRule {
        PolicyRule::from_fn(name, move |_| Ok(RuleOutcome::deny(reason)))
    }

    fn write_policy() -> AllowPolicy {
        AllowPolicy::new(
            AllowPolicyConfig {
                scope: Some("write".into()),
                ..AllowPolicyConfig::default()
            },
            ScopeRegistry::with_defaults(),
        )
    }

    #[tokio::test]
    async fn empty_engine_allows() {
        let engine = PolicyEngine::new();
        let outcome = engine.evaluate(&RequestContext::new("GET", "/")).await;
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn first_denial_wins() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(allow("a"));
        engine.add_rule(deny("b", "b denied"));
        engine.add_rule(deny("c", "c denied"));

        let outcome = engine.evaluate(&RequestContext::new("GET", "/")).await;
        assert!(!outcome.allowed);
        assert_eq!(outcome.reason, "b denied");
    }

    #[tokio::test]
    async fn priority_does_not_reorder() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(deny("low", "low first").with_priority(1));
        engine.add_rule(deny("high", "high second").with_priority(100));

        let outcome = engine.evaluate(&RequestContext::new("GET", "/")).await;
        assert_eq!(outcome.reason, "low first");
    }

    #[tokio::test]
    async fn named_policy_applies_after_rules() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(allow("a"));
        engine.register_policy("writers", write_policy());
        assert!(engine.has_policy("writers"));

        let reader = Keypoint::new("k1", "s1")
            .with_scopes(["read"])
            .with_policy("writers");
        let ctx = RequestContext::new("GET", "/").with_keypoint(reader);
        let outcome = engine.evaluate(&ctx).await;
        assert!(!outcome.allowed);
        assert_eq!(outcome.reason, "Policy requires scope: write");

        let admin = Keypoint::new("k2", "s2")
            .with_scopes(["admin"])
            .with_policy("writers");
        let ctx = RequestContext::new("GET", "/").with_keypoint(admin);
        assert!(engine.evaluate(&ctx).await.allowed);
    }

    #[tokio::test]
    async fn unknown_policy_fails_closed() {
        let engine = PolicyEngine::new();
        let kp = Keypoint::new("k1", "s1").with_policy("missing");
        let ctx = RequestContext::new("GET", "/").with_keypoint(kp);

        let outcome = engine.evaluate(&ctx).await;
        assert!(!outcome.allowed);
        assert_eq!(outcome.reason, "Unknown policy: missing");

        let decision = engine.evaluate_all(&ctx).await;
        assert!(!decision.allowed);
        assert_eq!(decision.violations[0].rule, "policy:missing");
    }

    #[tokio::test]
    async fn evaluate_all_runs_every_rule() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(deny("a", "a denied"));
        engine.add_rule(allow("b"));
        engine.add_rule(deny("c", "c denied"));

        let decision = engine.evaluate_all(&RequestContext::new("GET", "/x")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "a denied");
        assert_eq!(decision.evaluated_rules.len(), 3);
        assert_eq!(decision.violations.len(), 2);
        assert_eq!(decision.metadata["path"], "/x");
    }

    #[tokio::test]
    async fn evaluate_all_skips_policy_after_denial() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(deny("a", "a denied"));
        engine.register_policy("writers", write_policy());

        let kp = Keypoint::new("k1", "s1").with_policy("writers");
        let ctx = RequestContext::new("GET", "/").with_keypoint(kp);
        let decision = engine.evaluate_all(&ctx).await;
        assert_eq!(decision.evaluated_rules.len(), 1);
    }

    #[tokio::test]
    async fn enforce_raises_policy_error() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(deny("ip", "IP blocked: 10.0.0.1"));

        let err = engine
            .enforce(&RequestContext::new("GET", "/"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.decision().unwrap().reason, "IP blocked: 10.0.0.1");
    }
}
