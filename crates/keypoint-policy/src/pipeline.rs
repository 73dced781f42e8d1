//! Validator followed by the policy engine.

use std::sync::Arc;

use crate::context::RequestContext;
use crate::decision::AccessDecision;
use crate::engine::PolicyEngine;
use crate::error::Result;
use crate::validator::KeypointValidator;

/// The full request authorization path.
///
/// Cheap to clone; both halves are shared.
#[derive(Clone, Debug)]
pub struct AuthPipeline {
    validator: Option<KeypointValidator>,
    engine: Arc<PolicyEngine>,
}

impl AuthPipeline {
    pub fn new(validator: KeypointValidator, engine: PolicyEngine) -> Self {
        Self {
            validator: Some(validator),
            engine: Arc::new(engine),
        }
    }

    /// A pipeline that skips authentication and only runs rules.
    pub fn without_validator(engine: PolicyEngine) -> Self {
        Self {
            validator: None,
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn validator(&self) -> Option<&KeypointValidator> {
        self.validator.as_ref()
    }

    /// Authenticate, then evaluate every rule.
    ///
    /// # Errors
    ///
    /// [`AuthzError::Keypoint`](crate::AuthzError::Keypoint) when
    /// authentication fails and
    /// [`AuthzError::Policy`](crate::AuthzError::Policy) when a rule denies.
    pub async fn authorize(&self, ctx: &mut RequestContext) -> Result<AccessDecision> {
        if let Some(validator) = &self.validator {
            validator.validate(ctx).await?;
        }
        let decision = self.engine.evaluate_all(ctx).await;
        let summary = decision.summary();
        tracing::info!(
            decision_id = %summary.id,
            allowed = summary.allowed,
            method = %ctx.method,
            path = %ctx.path,
            caller = %ctx.caller_key(),
            rules_failed = summary.rules_failed,
            "authorization decided"
        );
        decision.into_result()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
