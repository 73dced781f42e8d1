//! Built-in rule factories.
//!
//! Each factory returns a ready-to-register [`PolicyRule`] named after the
//! check it performs. The evaluator types are public so callers can wrap
//! them under a different name or priority.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{FixedOffset, Local, Timelike};
use keypoint_store::scope::WILDCARD;
use keypoint_store::{ScopeRegistry, ip};

use crate::clock::{SharedClock, system_clock};
use crate::context::RequestContext;
use crate::rate_limit::RateLimiter;
use crate::rule::{PolicyRule, RuleEvaluator, RuleOutcome};

fn to_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

/// Allows requests whose uppercased method is listed.
#[derive(Debug, Clone)]
pub struct MethodRule {
    methods: BTreeSet<String>,
}

impl MethodRule {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods
                .into_iter()
                .map(|m| m.into().to_ascii_uppercase())
                .collect(),
        }
    }
}

#[async_trait]
impl RuleEvaluator for MethodRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let method = ctx.method.to_ascii_uppercase();
        if self.methods.contains(&method) {
            Ok(RuleOutcome::allow().with_reason("Method allowed"))
        } else {
            Ok(RuleOutcome::deny(format!("Method not allowed: {method}")))
        }
    }
}

pub fn method_rule<I, S>(methods: I) -> PolicyRule
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    PolicyRule::new("method", MethodRule::new(methods))
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Allows requests without an `Origin` header or from a listed origin.
#[derive(Debug, Clone)]
pub struct OriginRule {
    origins: BTreeSet<String>,
}

impl OriginRule {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origins: to_set(origins),
        }
    }
}

#[async_trait]
impl RuleEvaluator for OriginRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let Some(origin) = ctx.origin() else {
            return Ok(RuleOutcome::allow().with_reason("No origin header"));
        };
        if self.origins.is_empty()
            || self.origins.contains(WILDCARD)
            || self.origins.contains(origin)
        {
            Ok(RuleOutcome::allow().with_reason("Origin allowed"))
        } else {
            Ok(RuleOutcome::deny(format!("Origin not allowed: {origin}")))
        }
    }
}

pub fn origin_rule<I, S>(origins: I) -> PolicyRule
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    PolicyRule::new("origin", OriginRule::new(origins))
}

// ---------------------------------------------------------------------------
// IP
// ---------------------------------------------------------------------------

/// Blocklist first, then an optional allowlist.
///
/// Entries may be literal addresses, CIDR blocks or `start-end` ranges.
#[derive(Debug, Clone, Default)]
pub struct IpRule {
    allowed: Vec<String>,
    blocked: Vec<String>,
}

impl IpRule {
    pub fn new<A, B, S, T>(allowed: A, blocked: B) -> Self
    where
        A: IntoIterator<Item = S>,
        B: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            blocked: blocked.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl RuleEvaluator for IpRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let addr = ctx.ip.as_str();
        if ip::matches_any(&self.blocked, addr) {
            return Ok(RuleOutcome::deny(format!("IP blocked: {addr}")));
        }
        if !self.allowed.is_empty() && !ip::matches_any(&self.allowed, addr) {
            return Ok(RuleOutcome::deny(format!("IP not allowed: {addr}")));
        }
        Ok(RuleOutcome::allow().with_reason("IP allowed"))
    }
}

pub fn ip_rule<A, B, S, T>(allowed: A, blocked: B) -> PolicyRule
where
    A: IntoIterator<Item = S>,
    B: IntoIterator<Item = T>,
    S: Into<String>,
    T: Into<String>,
{
    PolicyRule::new("ip", IpRule::new(allowed, blocked))
}

// ---------------------------------------------------------------------------
// Time window
// ---------------------------------------------------------------------------

/// Allows requests whose hour falls in `[start_hour, end_hour)`.
///
/// A window with `start_hour > end_hour` wraps past midnight. Hours are
/// taken in the host's local time unless a fixed offset is set.
#[derive(Clone)]
pub struct TimeWindowRule {
    start_hour: u32,
    end_hour: u32,
    offset: Option<FixedOffset>,
    clock: SharedClock,
}

impl TimeWindowRule {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
            offset: None,
            clock: system_clock(),
        }
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn current_hour(&self) -> u32 {
        let now = self.clock.now();
        match self.offset {
            Some(offset) => now.with_timezone(&offset).hour(),
            None => now.with_timezone(&Local).hour(),
        }
    }

    fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl std::fmt::Debug for TimeWindowRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeWindowRule")
            .field("start_hour", &self.start_hour)
            .field("end_hour", &self.end_hour)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RuleEvaluator for TimeWindowRule {
    async fn evaluate(&self, _ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let hour = self.current_hour();
        if self.contains(hour) {
            Ok(RuleOutcome::allow().with_reason("Within allowed time window"))
        } else {
            Ok(RuleOutcome::deny("Outside allowed time window")
                .with_metadata("hour", hour)
                .with_metadata("startHour", self.start_hour)
                .with_metadata("endHour", self.end_hour))
        }
    }
}

pub fn time_window_rule(start_hour: u32, end_hour: u32) -> PolicyRule {
    PolicyRule::new("time_window", TimeWindowRule::new(start_hour, end_hour))
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

/// Per-caller sliding window keyed by keypoint id, else IP.
///
/// The window lives in `limiter`; rules handed clones of one limiter share
/// their counts.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    limiter: RateLimiter,
    limit: u32,
    window_secs: u64,
}

impl RateLimitRule {
    pub fn new(limiter: RateLimiter, limit: u32, window_secs: u64) -> Self {
        Self {
            limiter,
            limit,
            window_secs,
        }
    }
}

#[async_trait]
impl RuleEvaluator for RateLimitRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let status = self
            .limiter
            .check(ctx.caller_key(), self.limit, self.window_secs);
        let outcome = if status.allowed {
            RuleOutcome::allow().with_reason("Within rate limit")
        } else {
            RuleOutcome::deny("Rate limit exceeded")
        };
        Ok(outcome
            .with_metadata("remaining", status.remaining)
            .with_metadata("reset", status.reset.to_rfc3339()))
    }
}

pub fn rate_limit_rule(limiter: RateLimiter, limit: u32, window_secs: u64) -> PolicyRule {
    PolicyRule::new("rate_limit", RateLimitRule::new(limiter, limit, window_secs))
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Requires the attached keypoint to hold a scope, directly or inherited.
#[derive(Debug, Clone)]
pub struct ScopeRule {
    registry: ScopeRegistry,
    required: String,
}

impl ScopeRule {
    pub fn new(registry: ScopeRegistry, required: impl Into<String>) -> Self {
        Self {
            registry,
            required: required.into(),
        }
    }
}

#[async_trait]
impl RuleEvaluator for ScopeRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        if ctx.has_scope(&self.registry, &self.required) {
            Ok(RuleOutcome::allow().with_reason("Scope granted"))
        } else {
            Ok(
                RuleOutcome::deny(format!("Missing required scope: {}", self.required))
                    .with_metadata("requiredScope", self.required.clone()),
            )
        }
    }
}

pub fn scope_rule(registry: ScopeRegistry, required: impl Into<String>) -> PolicyRule {
    PolicyRule::new("scope", ScopeRule::new(registry, required))
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Allows requests whose protocol is listed (case-insensitive).
#[derive(Debug, Clone)]
pub struct ProtocolRule {
    protocols: BTreeSet<String>,
}

impl ProtocolRule {
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols
                .into_iter()
                .map(|p| p.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

#[async_trait]
impl RuleEvaluator for ProtocolRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let protocol = ctx.protocol.to_ascii_lowercase();
        if self.protocols.contains(&protocol) {
            Ok(RuleOutcome::allow().with_reason("Protocol allowed"))
        } else {
            Ok(RuleOutcome::deny(format!("Protocol not allowed: {protocol}")))
        }
    }
}

pub fn protocol_rule<I, S>(protocols: I) -> PolicyRule
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    PolicyRule::new("protocol", ProtocolRule::new(protocols))
}

// ---------------------------------------------------------------------------
// Keypoint restrictions
// ---------------------------------------------------------------------------

/// Enforces the attached keypoint's own protocol, origin and IP lists.
///
/// Requests without a keypoint pass; pair with a validator when a keypoint
/// is mandatory.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeypointRestrictionsRule;

#[async_trait]
impl RuleEvaluator for KeypointRestrictionsRule {
    async fn evaluate(&self, ctx: &RequestContext) -> anyhow::Result<RuleOutcome> {
        let Some(kp) = ctx.keypoint() else {
            return Ok(RuleOutcome::allow().with_reason("No keypoint attached"));
        };
        if !kp.validate_protocol(&ctx.protocol) {
            return Ok(RuleOutcome::deny(format!(
                "Protocol not permitted for keypoint: {}",
                ctx.protocol
            )));
        }
        if let Some(origin) = ctx.origin().filter(|o| !kp.validate_origin(o)) {
            return Ok(RuleOutcome::deny(format!(
                "Origin not permitted for keypoint: {origin}"
            )));
        }
        if !kp.validate_ip(&ctx.ip) {
            return Ok(RuleOutcome::deny(format!(
                "IP not permitted for keypoint: {}",
                ctx.ip
            )));
        }
        Ok(RuleOutcome::allow().with_reason("Keypoint restrictions satisfied"))
    }
}

pub fn keypoint_restrictions_rule() -> PolicyRule {
    PolicyRule::new("keypoint_restrictions", KeypointRestrictionsRule)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
