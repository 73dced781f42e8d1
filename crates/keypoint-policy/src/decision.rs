//! Access decisions.
//!
//! [`PolicyOutcome`] is the lightweight `{allowed, reason, metadata}` shape
//! returned by short-circuiting evaluation. [`AccessDecision`] is the full
//! audit record: every rule that ran, every violation, in evaluation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AuthzError, Result};

/// Result of `PolicyEngine::evaluate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PolicyOutcome {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            metadata: Map::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One rule's outcome inside a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule: String,
    pub allowed: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A denying rule's contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub reason: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Full, auditable decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    /// Correlation id for audit trails.
    pub id: Uuid,
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub evaluated_rules: Vec<RuleRecord>,
    pub timestamp: DateTime<Utc>,
}

/// Compact view of a decision for audit logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSummary {
    pub id: Uuid,
    pub allowed: bool,
    pub reason: String,
    pub rules_evaluated: usize,
    pub rules_passed: usize,
    pub rules_failed: usize,
    pub violated_rules: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AccessDecision {
    fn new(allowed: bool, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            allowed,
            reason: reason.into(),
            metadata: Map::new(),
            violations: Vec::new(),
            evaluated_rules: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn allow(reason: impl Into<String>) -> Self {
        Self::new(true, reason)
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::new(false, reason)
    }

    /// Override the decision timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Append a rule outcome.
    ///
    /// A denying record adds a violation, and the first violation flips the
    /// decision to deny with that rule's reason.
    pub fn record(&mut self, record: RuleRecord) {
        if !record.allowed {
            if self.allowed {
                self.allowed = false;
                self.reason = record.reason.clone();
            }
            self.violations.push(Violation {
                rule: record.rule.clone(),
                reason: record.reason.clone(),
                metadata: record.metadata.clone(),
            });
        }
        self.evaluated_rules.push(record);
    }

    /// Combine two decisions into a new one.
    ///
    /// `allowed` is the AND of both; violations and rule records are
    /// concatenated in order. The reason comes from the first denying side,
    /// or from `other` when both allow. Metadata keys from `other` win.
    pub fn merge(&self, other: &AccessDecision) -> AccessDecision {
        let reason = if !self.allowed {
            self.reason.clone()
        } else {
            other.reason.clone()
        };

        let mut metadata = self.metadata.clone();
        metadata.extend(other.metadata.clone());

        AccessDecision {
            id: Uuid::now_v7(),
            allowed: self.allowed && other.allowed,
            reason,
            metadata,
            violations: self
                .violations
                .iter()
                .chain(&other.violations)
                .cloned()
                .collect(),
            evaluated_rules: self
                .evaluated_rules
                .iter()
                .chain(&other.evaluated_rules)
                .cloned()
                .collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn summary(&self) -> DecisionSummary {
        let rules_passed = self.evaluated_rules.iter().filter(|r| r.allowed).count();
        DecisionSummary {
            id: self.id,
            allowed: self.allowed,
            reason: self.reason.clone(),
            rules_evaluated: self.evaluated_rules.len(),
            rules_passed,
            rules_failed: self.evaluated_rules.len() - rules_passed,
            violated_rules: self.violations.iter().map(|v| v.rule.clone()).collect(),
            timestamp: self.timestamp,
        }
    }

    /// The lightweight outcome view.
    pub fn outcome(&self) -> PolicyOutcome {
        PolicyOutcome {
            allowed: self.allowed,
            reason: self.reason.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Audit JSON: `{id, allowed, reason, violations, metadata, timestamp, evaluatedRules}`.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// `Ok(self)` when allowed, otherwise [`AuthzError::Policy`].
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(AuthzError::policy(self))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rule: &str, allowed: bool, reason: &str) -> RuleRecord {
        RuleRecord {
            rule: rule.into(),
            allowed,
            reason: reason.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn first_violation_sets_reason() {
        let mut decision = AccessDecision::allow("All rules passed");
        decision.record(record("method", true, "Method allowed"));
        decision.record(record("ip", false, "IP blocked"));
        decision.record(record("scope", false, "Missing required scope: write"));

        assert!(!decision.allowed);
        assert_eq!(decision.reason, "IP blocked");
        assert_eq!(decision.evaluated_rules.len(), 3);
        let violated: Vec<&str> = decision.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(violated, vec!["ip", "scope"]);
    }

    #[test]
    fn merge_and_semantics() {
        let mut a = AccessDecision::allow("a ok");
        a.record(record("one", true, "fine"));
        let mut b = AccessDecision::allow("b ok");
        b.record(record("two", false, "b says no"));

        let merged = a.merge(&b);
        assert!(!merged.allowed);
        assert_eq!(merged.reason, "b says no");
        let rules: Vec<&str> = merged.evaluated_rules.iter().map(|r| r.rule.as_str()).collect();
        assert_eq!(rules, vec!["one", "two"]);
        assert_eq!(merged.violations.len(), 1);

        // Inputs are untouched.
        assert!(a.allowed);
        assert_eq!(b.evaluated_rules.len(), 1);
    }

    #[test]
    fn merge_reason_preference() {
        let allow_a = AccessDecision::allow("first");
        let allow_b = AccessDecision::allow("second");
        assert_eq!(allow_a.merge(&allow_b).reason, "second");

        let deny_a = AccessDecision::deny("first denied");
        let deny_b = AccessDecision::deny("second denied");
        assert_eq!(deny_a.merge(&deny_b).reason, "first denied");
        assert_eq!(deny_a.merge(&allow_b).reason, "first denied");
        assert_eq!(allow_a.merge(&deny_b).reason, "second denied");
    }

    #[test]
    fn summary_counts() {
        let mut decision = AccessDecision::allow("All rules passed");
        decision.record(record("a", true, "ok"));
        decision.record(record("b", false, "no"));
        decision.record(record("c", true, "ok"));

        let summary = decision.summary();
        assert_eq!(summary.rules_evaluated, 3);
        assert_eq!(summary.rules_passed, 2);
        assert_eq!(summary.rules_failed, 1);
        assert_eq!(summary.violated_rules, vec!["b".to_string()]);
        assert!(!summary.allowed);
    }

    #[test]
    fn json_shape() {
        let mut decision = AccessDecision::allow("ok").with_metadata("path", "/v1");
        decision.record(record("method", true, "Method allowed"));
        let json = decision.to_json();

        for field in [
            "id",
            "allowed",
            "reason",
            "violations",
            "metadata",
            "timestamp",
            "evaluatedRules",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["evaluatedRules"][0]["rule"], "method");
        assert_eq!(json["metadata"]["path"], "/v1");
    }

    #[test]
    fn into_result() {
        assert!(AccessDecision::allow("ok").into_result().is_ok());
        let err = AccessDecision::deny("nope").into_result().unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
