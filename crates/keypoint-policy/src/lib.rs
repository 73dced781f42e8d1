//! Request authorization on top of [`keypoint_store`].
//!
//! A request flows through two stages:
//!
//! 1. [`KeypointValidator`] authenticates the caller from the
//!    `x-keypoint-id` / `x-keypoint-secret` headers (or the `keypointId`
//!    query parameter) and attaches the keypoint to the [`RequestContext`].
//! 2. [`PolicyEngine`] runs its rules in registration order, then any named
//!    policy the keypoint references, producing a [`PolicyOutcome`] or a full
//!    [`AccessDecision`].
//!
//! [`AuthPipeline`] chains both; [`AuthzConfig`] builds one from a TOML or
//! JSON file.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keypoint_policy::{AuthPipeline, KeypointValidator, PolicyEngine, RequestContext, rules};
//! use keypoint_store::{Keypoint, KeypointStore, MemoryKeypointStore, ScopeRegistry};
//!
//! # async fn example() -> keypoint_policy::Result<()> {
//! let store = MemoryKeypointStore::new();
//! store
//!     .set(Keypoint::new("k1", "s1").with_scopes(["admin"]))
//!     .await?;
//!
//! let mut engine = PolicyEngine::new();
//! engine.add_rule(rules::method_rule(["GET", "POST"]));
//! engine.add_rule(rules::scope_rule(ScopeRegistry::with_defaults(), "write"));
//!
//! let pipeline = AuthPipeline::new(KeypointValidator::new(Arc::new(store)), engine);
//! let mut ctx = RequestContext::new("GET", "/v1/items")
//!     .with_header("x-keypoint-id", "k1")
//!     .with_header("x-keypoint-secret", "s1");
//! let decision = pipeline.authorize(&mut ctx).await?;
//! assert!(decision.allowed);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod decision;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod rule;
pub mod rules;
pub mod validator;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::AuthzConfig;
pub use context::{Headers, RequestContext};
pub use decision::{AccessDecision, DecisionSummary, PolicyOutcome, RuleRecord, Violation};
pub use engine::PolicyEngine;
pub use error::{AuthzError, KeypointFailure, Result};
pub use pipeline::AuthPipeline;
pub use policy::{AllowPolicy, AllowPolicyConfig, NamedPolicy};
pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use rule::{FnEvaluator, PolicyRule, RuleEvaluator, RuleOutcome};
pub use validator::{KeypointValidator, ValidatorConfig};
