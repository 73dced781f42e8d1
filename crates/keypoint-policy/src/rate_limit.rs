//! Per-key sliding-window rate limiter.
//!
//! State is process-local. Each key holds the timestamps of its admitted
//! requests; a check prunes entries older than the window before counting.
//! Keys whose window has fully elapsed are dropped by [`RateLimiter::sweep`],
//! which also runs on its own every [`SWEEP_EVERY`] checks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::clock::{SharedClock, system_clock};

/// Windows longer than this are clamped.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Number of checks between automatic sweeps.
pub const SWEEP_EVERY: u64 = 1024;

/// Result of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// When the oldest tracked request leaves the window.
    pub reset: DateTime<Utc>,
}

#[derive(Debug)]
struct Bucket {
    stamps: VecDeque<DateTime<Utc>>,
    window: Duration,
}

impl Bucket {
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.stamps.front().is_some_and(|t| *t <= cutoff) {
            self.stamps.pop_front();
        }
    }
}

/// Sliding-window limiter.
///
/// Clones share the same counters. Two rules that must count independently
/// need separate limiters.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Bucket>>,
    checks: Arc<AtomicU64>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            checks: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Admit or reject one request for `key`.
    ///
    /// Denied requests are not recorded.
    pub fn check(&self, key: &str, limit: u32, window_secs: u64) -> RateLimitStatus {
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep();
        }

        let now = self.clock.now();
        let window = Duration::seconds(window_secs.min(MAX_WINDOW_SECS) as i64);

        if limit == 0 {
            tracing::debug!(key = %key, limit, "rate limit exceeded");
            return RateLimitStatus {
                allowed: false,
                remaining: 0,
                reset: now + window,
            };
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Bucket {
            stamps: VecDeque::new(),
            window,
        });
        let bucket = entry.value_mut();
        bucket.window = window;
        bucket.prune(now);

        let used = u32::try_from(bucket.stamps.len()).unwrap_or(u32::MAX);
        if used >= limit {
            let reset = bucket.stamps.front().map_or(now + window, |t| *t + window);
            tracing::debug!(key = %key, limit, "rate limit exceeded");
            return RateLimitStatus {
                allowed: false,
                remaining: 0,
                reset,
            };
        }

        bucket.stamps.push_back(now);
        let reset = bucket.stamps.front().map_or(now + window, |t| *t + window);
        RateLimitStatus {
            allowed: true,
            remaining: limit - used - 1,
            reset,
        }
    }

    /// Drop every key whose window holds no live requests. Returns the
    /// number of keys removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, bucket| {
            bucket.prune(now);
            !bucket.stamps.is_empty()
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, "idle rate-limit keys swept");
        }
        removed
    }

    /// Forget all history for `key`.
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tracked_keys", &self.windows.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
