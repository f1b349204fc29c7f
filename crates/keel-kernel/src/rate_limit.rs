//! Rate-limit verdicts and the sliding-window limiter behind the in-process
//! kernel.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Verdict of `CheckRateLimit` for one (user_id, endpoint) pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub exceeded: bool,
    pub reason: String,
    pub limit_type: String,
    pub current_count: u64,
    pub limit: u64,
    pub retry_after_seconds: u64,
    pub remaining: u64,
}

/// Ceilings for one endpoint. A `None` window is not enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_minute: Option<u64>,
    pub per_hour: Option<u64>,
    pub per_day: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: Some(60),
            per_hour: Some(1000),
            per_day: Some(10_000),
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(limit: u64) -> Self {
        Self {
            per_minute: Some(limit),
            per_hour: None,
            per_day: None,
        }
    }

    fn windows(&self) -> impl Iterator<Item = (&'static str, Duration, u64)> {
        [
            ("per_minute", Duration::from_secs(60), self.per_minute),
            ("per_hour", Duration::from_secs(3600), self.per_hour),
            ("per_day", Duration::from_secs(86_400), self.per_day),
        ]
        .into_iter()
        .filter_map(|(name, len, limit)| limit.map(|l| (name, len, l)))
    }

    /// Longest enforced window; older calls no longer count.
    fn horizon(&self) -> Duration {
        self.windows()
            .map(|(_, len, _)| len)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Default ceilings plus per-endpoint overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub default: RateLimitConfig,
    pub endpoints: HashMap<String, RateLimitConfig>,
}

impl RateLimitPolicy {
    pub fn new(default: RateLimitConfig) -> Self {
        Self {
            default,
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, config: RateLimitConfig) -> Self {
        self.endpoints.insert(endpoint.into(), config);
        self
    }

    pub fn config_for(&self, endpoint: &str) -> RateLimitConfig {
        self.endpoints.get(endpoint).copied().unwrap_or(self.default)
    }
}

/// How often idle (user, endpoint) keys are dropped.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Admitted-call timestamps per (user, endpoint). A key is kept only while it
/// holds calls inside its longest window.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindowLimiter {
    policy: RateLimitPolicy,
    calls: HashMap<(String, String), VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl SlidingWindowLimiter {
    pub(crate) fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            calls: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Checks and, when admitted, counts one call.
    pub(crate) fn check(&mut self, user_id: &str, endpoint: &str, now: Instant) -> RateLimitResult {
        self.sweep(now);
        let config = self.policy.config_for(endpoint);
        let key = (user_id.to_string(), endpoint.to_string());
        let mut history = self.calls.remove(&key).unwrap_or_default();
        let horizon = config.horizon();
        while history
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= horizon)
        {
            history.pop_front();
        }

        let verdict = evaluate(&config, &mut history, now);
        if !history.is_empty() {
            self.calls.insert(key, history);
        }
        verdict
    }

    fn sweep(&mut self, now: Instant) {
        if self
            .last_sweep
            .is_some_and(|at| now.saturating_duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);
        let policy = &self.policy;
        self.calls.retain(|(_, endpoint), history| {
            let horizon = policy.config_for(endpoint).horizon();
            history
                .back()
                .is_some_and(|t| now.saturating_duration_since(*t) < horizon)
        });
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.calls.len()
    }
}

fn evaluate(
    config: &RateLimitConfig,
    history: &mut VecDeque<Instant>,
    now: Instant,
) -> RateLimitResult {
    let mut tightest: Option<(&'static str, u64, u64)> = None;
    for (name, len, limit) in config.windows() {
        let count = history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < len)
            .count() as u64;
        if count >= limit {
            let oldest = history
                .iter()
                .find(|t| now.saturating_duration_since(**t) < len)
                .copied()
                .unwrap_or(now);
            let wait = (oldest + len).saturating_duration_since(now);
            let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            return RateLimitResult {
                allowed: false,
                exceeded: true,
                reason: format!("{name} limit of {limit} exceeded"),
                limit_type: name.to_string(),
                current_count: count,
                limit,
                retry_after_seconds: retry_after.max(1),
                remaining: 0,
            };
        }
        let remaining = limit - count;
        if tightest.map_or(true, |(_, _, r)| remaining < r) {
            tightest = Some((name, limit, remaining));
        }
    }

    history.push_back(now);
    match tightest {
        Some((name, limit, remaining)) => RateLimitResult {
            allowed: true,
            limit_type: name.to_string(),
            current_count: limit - remaining,
            limit,
            remaining,
            ..RateLimitResult::default()
        },
        None => RateLimitResult {
            allowed: true,
            ..RateLimitResult::default()
        },
    }
}
