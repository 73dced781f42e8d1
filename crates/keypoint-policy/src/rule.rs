//! Policy rules and the evaluation wrapper.
//!
//! A [`RuleEvaluator`] produces a raw [`RuleOutcome`]. [`PolicyRule`] wraps
//! it so that disabled rules allow without running, and so evaluator
//! errors, panics and timeouts become denials instead of escaping the
//! pipeline.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::context::RequestContext;
use crate::decision::RuleRecord;

/// Raw evaluator result. A missing `allowed` means permit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub allowed: Option<bool>,
    pub reason: Option<String>,
    pub metadata: Map<String, Value>,
}

impl RuleOutcome {
    pub fn allow() -> Self {
        Self {
            allowed: Some(true),
            ..Self::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: Some(false),
            reason: Some(reason.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed.unwrap_or(true)
    }
}

/// Decides a single rule for a request.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome>;
}

/// Adapts a synchronous closure into a [`RuleEvaluator`].
pub struct FnEvaluator<F>(pub F);

#[async_trait]
impl<F> RuleEvaluator for FnEvaluator<F>
where
    F: Fn(&RequestContext) -> anyhow::Result<RuleOutcome> + Send + Sync,
{
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        (self.0)(ctx)
    }
}

/// A named, prioritized, switchable rule.
///
/// `priority` is carried for reporting only; engines run rules in
/// registration order. Names are labels and need not be unique.
#[derive(Clone)]
pub struct PolicyRule {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    evaluator: Arc<dyn RuleEvaluator>,
}

impl PolicyRule {
    pub fn new(name: impl Into<String>, evaluator: impl RuleEvaluator + 'static) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            evaluator: Arc::new(evaluator),
        }
    }

    /// Build a rule from a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RequestContext) -> anyhow::Result<RuleOutcome> + Send + Sync + 'static,
    {
        Self::new(name, FnEvaluator(f))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run the evaluator and normalize its result.
    ///
    /// Never fails: errors, panics and an elapsed `timeout` are recorded as
    /// denials.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        timeout: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RuleRecord {
        if !self.enabled {
            return self.record(true, "Rule disabled".to_string(), Map::new(), now);
        }

        let run = AssertUnwindSafe(self.evaluator.evaluate(ctx)).catch_unwind();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        rule = %self.name,
                        timeout_ms = limit.as_millis() as u64,
                        "rule evaluation timed out"
                    );
                    return self.record(
                        false,
                        "Rule evaluation timed out".to_string(),
                        Map::new(),
                        now,
                    );
                }
            },
            None => run.await,
        };

        let (allowed, reason, metadata) = match result {
            Ok(Ok(outcome)) => {
                let allowed = outcome.is_allowed();
                let reason = outcome.reason.unwrap_or_else(|| {
                    if allowed {
                        "Rule passed".to_string()
                    } else {
                        "Rule denied".to_string()
                    }
                });
                (allowed, reason, outcome.metadata)
            }
            Ok(Err(e)) => {
                tracing::warn!(rule = %self.name, error = %e, "rule evaluator failed");
                (false, format!("Rule evaluation failed: {e}"), Map::new())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(rule = %self.name, error = %message, "rule evaluator panicked");
                (false, format!("Rule evaluation failed: {message}"), Map::new())
            }
        };

        tracing::trace!(rule = %self.name, allowed, reason = %reason, "rule evaluated");
        self.record(allowed, reason, metadata, now)
    }

    fn record(
        &self,
        allowed: bool,
        reason: String,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> RuleRecord {
        RuleRecord {
            rule: self.name.clone(),
            allowed,
            reason,
            timestamp: now,
            metadata,
        }
    }
}

impl std::fmt::Debug for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("GET", "/v1/items")
    }

    #[tokio::test]
    async fn missing_allowed_means_permit() {
        let rule = PolicyRule::from_fn("noop", |_| Ok(RuleOutcome::default()));
        let record = rule.evaluate(&ctx(), None, Utc::now()).await;
        assert!(record.allowed);
        assert_eq!(record.rule, "noop");
    }

    #[tokio::test]
    async fn disabled_rule_skips_evaluator() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let rule = PolicyRule::from_fn("deny-all", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(RuleOutcome::deny("no"))
        })
        .with_enabled(false);

        let record = rule.evaluate(&ctx(), None, Utc::now()).await;
        assert!(record.allowed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn evaluator_error_becomes_denial() {
        let rule = PolicyRule::from_fn("broken", |_| Err(anyhow::anyhow!("database offline")));
        let record = rule.evaluate(&ctx(), None, Utc::now()).await;
        assert!(!record.allowed);
        assert_eq!(record.reason, "Rule evaluation failed: database offline");
    }

    #[tokio::test]
    async fn evaluator_panic_becomes_denial() {
        let rule = PolicyRule::from_fn("panicky", |_| panic!("boom"));
        let record = rule.evaluate(&ctx(), None, Utc::now()).await;
        assert!(!record.allowed);
        assert_eq!(record.reason, "Rule evaluation failed: boom");
    }

    struct Stuck;

    #[async_trait]
    impl RuleEvaluator for Stuck {
        async fn evaluate(&self, _ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RuleOutcome::allow())
        }
    }

    #[tokio::test]
    async fn timeout_becomes_denial() {
        let rule = PolicyRule::new("stuck", Stuck);
        let record = rule
            .evaluate(&ctx(), Some(Duration::from_millis(20)), Utc::now())
            .await;
        assert!(!record.allowed);
        assert_eq!(record.reason, "Rule evaluation timed out");
    }

    #[tokio::test]
    async fn metadata_is_carried() {
        let rule = PolicyRule::from_fn("meta", |_| {
            Ok(RuleOutcome::allow()
                .with_reason("fine")
                .with_metadata("remaining", 3))
        })
        .with_priority(10);
        let record = rule.evaluate(&ctx(), None, Utc::now()).await;
        assert_eq!(record.reason, "fine");
        assert_eq!(record.metadata["remaining"], 3);
        assert_eq!(rule.priority, 10);
    }
}
