//! Declarative configuration.
//!
//! An [`AuthzConfig`] file (TOML, or JSON when the extension is `.json`)
//! declares extra scopes, the rule chain and named policies. The builders
//! wire everything explicitly; nothing is global.
//!
//! ```toml
//! [store]
//! path = "keypoints.json"
//!
//! [engine]
//! rule_timeout_ms = 250
//!
//! [scopes.billing]
//! description = "Billing endpoints"
//! inherits = ["read"]
//!
//! [[rules]]
//! type = "method"
//! methods = ["GET", "POST"]
//!
//! [[rules]]
//! type = "rate_limit"
//! limit = 100
//! window = 60
//!
//! [policies.writers]
//! scope = "write"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use keypoint_store::{FileKeypointStore, KeypointStore, MemoryKeypointStore, ScopeRegistry};
use serde::{Deserialize, Serialize};

use crate::clock::{SharedClock, system_clock};
use crate::engine::PolicyEngine;
use crate::error::{AuthzError, Result};
use crate::pipeline::AuthPipeline;
use crate::policy::{AllowPolicy, AllowPolicyConfig};
use crate::rate_limit::RateLimiter;
use crate::rule::PolicyRule;
use crate::rules::{
    IpRule, KeypointRestrictionsRule, MethodRule, OriginRule, ProtocolRule, RateLimitRule,
    ScopeRule, TimeWindowRule,
};
use crate::validator::{KeypointValidator, ValidatorConfig};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    pub store: StoreConfig,
    pub validator: ValidatorConfig,
    pub engine: EngineConfig,
    /// Extra scopes layered over the default hierarchy.
    pub scopes: BTreeMap<String, ScopeConfig>,
    /// The rule chain, in evaluation order.
    pub rules: Vec<RuleConfig>,
    /// Named `allow` policies.
    pub policies: BTreeMap<String, AllowPolicyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backing file; an in-memory store is used when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rule_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub description: String,
    pub inherits: Vec<String>,
}

/// One `[[rules]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Defaults to the rule type.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: RuleKind,
}

fn default_enabled() -> bool {
    true
}

/// Built-in rule declarations, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Method {
        methods: Vec<String>,
    },
    Origin {
        #[serde(default)]
        origins: Vec<String>,
    },
    Ip {
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        block: Vec<String>,
    },
    TimeWindow {
        start_hour: u32,
        end_hour: u32,
        /// Fixed offset from UTC; host local time when unset.
        #[serde(default)]
        utc_offset_minutes: Option<i32>,
    },
    RateLimit {
        limit: u32,
        /// Window length in seconds.
        window: u64,
    },
    Scope {
        scope: String,
    },
    Protocol {
        protocols: Vec<String>,
    },
    KeypointRestrictions,
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Method { .. } => "method",
            Self::Origin { .. } => "origin",
            Self::Ip { .. } => "ip",
            Self::TimeWindow { .. } => "time_window",
            Self::RateLimit { .. } => "rate_limit",
            Self::Scope { .. } => "scope",
            Self::Protocol { .. } => "protocol",
            Self::KeypointRestrictions => "keypoint_restrictions",
        }
    }
}

fn config_error(reason: impl Into<String>) -> AuthzError {
    AuthzError::Config {
        reason: reason.into(),
    }
}

impl AuthzConfig {
    /// Load from a file; `.json` files are parsed as JSON, anything else as
    /// TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!("failed to read {}: {e}", path.display()))
        })?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        tracing::info!(
            path = %path.display(),
            rules = config.rules.len(),
            policies = config.policies.len(),
            "authorization config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| config_error(format!("failed to parse TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| config_error(format!("failed to parse JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no rule could honor.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            let label = rule.name.as_deref().unwrap_or(rule.kind.type_name());
            match &rule.kind {
                RuleKind::Method { methods } if methods.is_empty() => {
                    return Err(config_error(format!("rule {label}: methods is empty")));
                }
                RuleKind::Protocol { protocols } if protocols.is_empty() => {
                    return Err(config_error(format!("rule {label}: protocols is empty")));
                }
                RuleKind::TimeWindow {
                    start_hour,
                    end_hour,
                    utc_offset_minutes,
                } => {
                    if *start_hour > 23 || *end_hour > 24 {
                        return Err(config_error(format!(
                            "rule {label}: hours must be within 0..=24"
                        )));
                    }
                    if utc_offset_minutes.is_some_and(|m| offset(m).is_none()) {
                        return Err(config_error(format!(
                            "rule {label}: utc_offset_minutes out of range"
                        )));
                    }
                }
                RuleKind::RateLimit { window: 0, .. } => {
                    return Err(config_error(format!("rule {label}: window must be positive")));
                }
                RuleKind::Scope { scope } if scope.trim().is_empty() => {
                    return Err(config_error(format!("rule {label}: scope is empty")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The default hierarchy plus configured scopes and edges.
    pub fn build_registry(&self) -> Result<ScopeRegistry> {
        let registry = ScopeRegistry::with_defaults();
        for (name, scope) in &self.scopes {
            registry.define_scope(name.clone(), scope.description.clone(), None);
        }
        for (name, scope) in &self.scopes {
            if scope.inherits.is_empty() {
                continue;
            }
            registry
                .validate_scopes(&scope.inherits)
                .map_err(|e| config_error(format!("scope {name}: {e}")))?;
            registry.add_inheritance(name.clone(), scope.inherits.iter().cloned());
        }
        Ok(registry)
    }

    /// Build the rule chain and named policies.
    ///
    /// Every `rate_limit` rule gets its own limiter, so rules with different
    /// windows count the same caller independently.
    pub fn build_engine(
        &self,
        registry: &ScopeRegistry,
        clock: SharedClock,
    ) -> Result<PolicyEngine> {
        let mut engine = PolicyEngine::new().with_clock(Arc::clone(&clock));
        if let Some(ms) = self.engine.rule_timeout_ms {
            engine = engine.with_rule_timeout(Duration::from_millis(ms));
        }

        for rule in &self.rules {
            engine.add_rule(build_rule(rule, registry, &clock)?);
        }

        for (name, policy) in &self.policies {
            if let Some(scope) = &policy.scope {
                if !registry.validate_scope(scope) {
                    tracing::warn!(
                        policy = %name,
                        scope = %scope,
                        "policy requires an undefined scope"
                    );
                }
            }
            let policy = AllowPolicy::new(policy.clone(), registry.clone());
            engine.register_policy(name.clone(), policy);
        }

        Ok(engine)
    }

    /// Wire validator and engine around `store` using the system clock.
    pub fn build_pipeline(&self, store: Arc<dyn KeypointStore>) -> Result<AuthPipeline> {
        self.build_pipeline_with_clock(store, system_clock())
    }

    pub fn build_pipeline_with_clock(
        &self,
        store: Arc<dyn KeypointStore>,
        clock: SharedClock,
    ) -> Result<AuthPipeline> {
        let registry = self.build_registry()?;
        let engine = self.build_engine(&registry, Arc::clone(&clock))?;
        let validator = KeypointValidator::new(store)
            .with_config(self.validator.clone())
            .with_clock(clock);
        Ok(AuthPipeline::new(validator, engine))
    }

    /// Open the configured store: file-backed when `[store] path` is set.
    pub async fn open_store(&self) -> Result<Arc<dyn KeypointStore>> {
        match &self.store.path {
            Some(path) => Ok(Arc::new(FileKeypointStore::open(path).await?)),
            None => Ok(Arc::new(MemoryKeypointStore::new())),
        }
    }
}

fn offset(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}

fn build_rule(
    config: &RuleConfig,
    registry: &ScopeRegistry,
    clock: &SharedClock,
) -> Result<PolicyRule> {
    let name = config
        .name
        .clone()
        .unwrap_or_else(|| config.kind.type_name().to_string());

    let rule = match &config.kind {
        RuleKind::Method { methods } => PolicyRule::new(name, MethodRule::new(methods.clone())),
        RuleKind::Origin { origins } => PolicyRule::new(name, OriginRule::new(origins.clone())),
        RuleKind::Ip { allow, block } => {
            PolicyRule::new(name, IpRule::new(allow.clone(), block.clone()))
        }
        RuleKind::TimeWindow {
            start_hour,
            end_hour,
            utc_offset_minutes,
        } => {
            let mut window =
                TimeWindowRule::new(*start_hour, *end_hour).with_clock(Arc::clone(clock));
            if let Some(minutes) = utc_offset_minutes {
                let fixed = offset(*minutes)
                    .ok_or_else(|| config_error(format!("rule {name}: invalid utc offset")))?;
                window = window.with_utc_offset(fixed);
            }
            PolicyRule::new(name, window)
        }
        RuleKind::RateLimit { limit, window } => {
            let limiter = RateLimiter::with_clock(Arc::clone(clock));
            PolicyRule::new(name, RateLimitRule::new(limiter, *limit, *window))
        }
        RuleKind::Scope { scope } => {
            if !registry.validate_scope(scope) {
                tracing::warn!(rule = %name, scope = %scope, "rule requires an undefined scope");
            }
            PolicyRule::new(name, ScopeRule::new(registry.clone(), scope.clone()))
        }
        RuleKind::Protocol { protocols } => {
            PolicyRule::new(name, ProtocolRule::new(protocols.clone()))
        }
        RuleKind::KeypointRestrictions => PolicyRule::new(name, KeypointRestrictionsRule),
    };

    Ok(rule
        .with_priority(config.priority)
        .with_enabled(config.enabled))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
