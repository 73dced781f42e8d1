//! The keypoint credential record.
//!
//! A [`Keypoint`] identifies a caller by `keyId` and a shared secret, and
//! carries the scopes, transports, origins and addresses it may use. The
//! serialized form uses camelCase field names so persisted files stay
//! interchangeable with other implementations:
//!
//! ```json
//! {
//!   "keyId": "k1", "secret": "s1", "name": "ci", "scopes": ["read"],
//!   "protocols": ["https"], "allowedOrigins": [], "allowedIps": [],
//!   "rateLimit": { "requests": 100, "window": 60 },
//!   "expiresAt": null, "createdAt": "2026-01-01T00:00:00Z", "metadata": {}
//! }
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ip;
use crate::scope::{WILDCARD, pattern_matches};

/// Metadata key naming the policy a keypoint is bound to.
pub const POLICY_METADATA_KEY: &str = "policy";

/// Advisory request budget. Enforcement belongs to the caller's limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests allowed per window.
    pub requests: u32,
    /// Window length in seconds.
    pub window: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests: 100,
            window: 60,
        }
    }
}

/// A credential record.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypoint {
    /// Unique, immutable identity.
    pub key_id: String,

    /// Shared secret, compared verbatim.
    pub secret: String,

    /// Display name; not unique.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub scopes: BTreeSet<String>,

    /// Allowed transport schemes. Empty means any.
    #[serde(default)]
    pub protocols: BTreeSet<String>,

    /// Allowed `Origin` values. Empty means any; `*` allows all.
    #[serde(default)]
    pub allowed_origins: BTreeSet<String>,

    /// Literal IPs, CIDR blocks or `start-end` ranges. Empty means any.
    #[serde(default)]
    pub allowed_ips: BTreeSet<String>,

    #[serde(default)]
    pub rate_limit: RateLimit,

    /// `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Open key/value bag. `metadata.policy` names a registered policy.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Keypoint {
    /// Create a keypoint with no scopes and no restrictions.
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
            name: String::new(),
            scopes: BTreeSet::new(),
            protocols: BTreeSet::new(),
            allowed_origins: BTreeSet::new(),
            allowed_ips: BTreeSet::new(),
            rate_limit: RateLimit::default(),
            expires_at: None,
            created_at: Utc::now(),
            updated_at: None,
            metadata: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rate_limit(mut self, requests: u32, window: u64) -> Self {
        self.rate_limit = RateLimit { requests, window };
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Bind the keypoint to a named policy via `metadata.policy`.
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.metadata
            .insert(POLICY_METADATA_KEY.to_string(), Value::String(policy.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the keypoint has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Whether the keypoint has expired as of the system clock.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check the keypoint's own grants, without inheritance.
    ///
    /// Matches a direct grant, a `*` grant, or a wildcard-pattern grant such
    /// as `files:*`.
    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes.contains(WILDCARD)
            || self.scopes.contains(required)
            || self
                .scopes
                .iter()
                .any(|granted| granted.contains('*') && pattern_matches(granted, required))
    }

    /// Whether the keypoint may be used over `protocol` (case-insensitive).
    pub fn validate_protocol(&self, protocol: &str) -> bool {
        self.protocols.is_empty()
            || self
                .protocols
                .iter()
                .any(|p| p == WILDCARD || p.eq_ignore_ascii_case(protocol))
    }

    /// Whether requests from `origin` are allowed.
    pub fn validate_origin(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self.allowed_origins.contains(WILDCARD)
            || self.allowed_origins.contains(origin)
    }

    /// Whether requests from `ip` are allowed.
    pub fn validate_ip(&self, ip: &str) -> bool {
        self.allowed_ips.is_empty()
            || self.allowed_ips.contains(WILDCARD)
            || ip::matches_any(&self.allowed_ips, ip)
    }

    /// Name of the policy referenced by `metadata.policy`, if any.
    pub fn policy_name(&self) -> Option<&str> {
        self.metadata.get(POLICY_METADATA_KEY).and_then(Value::as_str)
    }
}

impl std::fmt::Debug for Keypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypoint")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .field("name", &self.name)
            .field("scopes", &self.scopes)
            .field("protocols", &self.protocols)
            .field("allowed_origins", &self.allowed_origins)
            .field("allowed_ips", &self.allowed_ips)
            .field("rate_limit", &self.rate_limit)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Partial update applied by `KeypointStore::update`.
///
/// `None` leaves a field unchanged. The key id cannot be patched.
#[derive(Debug, Clone, Default)]
pub struct KeypointPatch {
    pub secret: Option<String>,
    pub name: Option<String>,
    pub scopes: Option<BTreeSet<String>>,
    pub protocols: Option<BTreeSet<String>>,
    pub allowed_origins: Option<BTreeSet<String>>,
    pub allowed_ips: Option<BTreeSet<String>>,
    pub rate_limit: Option<RateLimit>,
    /// `Some(None)` clears the expiry.
    pub expires_at: Option<Option<DateTime<Utc>>>,
    /// Keys are merged into the existing metadata.
    pub metadata: Option<Map<String, Value>>,
}

impl KeypointPatch {
    /// Apply onto `keypoint` and stamp `updatedAt`.
    pub fn apply(self, keypoint: &mut Keypoint, now: DateTime<Utc>) {
        if let Some(secret) = self.secret {
            keypoint.secret = secret;
        }
        if let Some(name) = self.name {
            keypoint.name = name;
        }
        if let Some(scopes) = self.scopes {
            keypoint.scopes = scopes;
        }
        if let Some(protocols) = self.protocols {
            keypoint.protocols = protocols;
        }
        if let Some(origins) = self.allowed_origins {
            keypoint.allowed_origins = origins;
        }
        if let Some(ips) = self.allowed_ips {
            keypoint.allowed_ips = ips;
        }
        if let Some(rate_limit) = self.rate_limit {
            keypoint.rate_limit = rate_limit;
        }
        if let Some(expires_at) = self.expires_at {
            keypoint.expires_at = expires_at;
        }
        if let Some(metadata) = self.metadata {
            keypoint.metadata.extend(metadata);
        }
        keypoint.updated_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
