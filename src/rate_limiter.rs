//! # Sliding-Window Rate Limiter
//!
//! Bounds the request rate per `(identity, endpoint)` pair. Each key keeps the
//! timestamps (epoch milliseconds) of the requests it admitted inside the
//! closed window `[now - window_ms, now]`. Timestamps older than that are
//! pruned before every count, so no such window ever holds more than
//! `max_requests` admitted requests.
//!
//! Keys are independent: each window is read and updated while holding its
//! map entry, so a busy identity never blocks an unrelated one and the idle
//! sweep can never drop a window between a check and its write.
//!
//! The check itself ([`evaluate_window`]) is a pure function over a window's
//! timestamps. [`RateLimitPolicy`] objects are applied at call sites through
//! [`RateLimiter::guard`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// Endpoint name used for calls to the embedding provider.
pub const EMBEDDINGS_ENDPOINT: &str = "embeddings";
/// Endpoint name used for single-student recommendation requests.
pub const RECOMMENDATIONS_ENDPOINT: &str = "recommendations";
/// Endpoint name used for batch submissions.
pub const BATCH_ENDPOINT: &str = "batch";

const MAX_IDENTITY_LEN: usize = 128;

/// Limit applied to one `(identity, endpoint)` window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, window_ms: u64) -> Self {
        Self { max_requests, window_ms }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
        }
    }
}

/// Outcome of a rate-limit check.
///
/// The serialized shape (`allowed`, `remaining`, `resetTime`, `totalHits`) is
/// consumed by client retry logic and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: usize,
    /// Epoch milliseconds after which the oldest counted request leaves the window
    pub reset_time: i64,
    /// Requests counted in the window, including this one when admitted
    pub total_hits: usize,
}

impl RateLimitResult {
    /// Seconds until a retry can succeed, rounded up.
    pub fn retry_after_seconds(&self, now_ms: i64) -> u64 {
        let remaining_ms = (self.reset_time - now_ms).max(0) as u64;
        remaining_ms.div_ceil(1000)
    }

    /// Standard `X-RateLimit-*` header pairs for transport layers.
    pub fn headers(&self, limit: usize) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", (self.reset_time / 1000).to_string()),
        ]
    }
}

/// Rate limiter configuration: per-endpoint defaults plus a fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub endpoint_limits: HashMap<String, RateLimitConfig>,
    pub fallback: RateLimitConfig,
    /// Interval of the idle-window sweep
    pub sweep_interval_secs: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut endpoint_limits = HashMap::new();
        endpoint_limits.insert(EMBEDDINGS_ENDPOINT.to_string(), RateLimitConfig::new(60, 60_000));
        endpoint_limits.insert(RECOMMENDATIONS_ENDPOINT.to_string(), RateLimitConfig::new(10, 60_000));
        endpoint_limits.insert(BATCH_ENDPOINT.to_string(), RateLimitConfig::new(5, 60_000));

        Self {
            endpoint_limits,
            fallback: RateLimitConfig::default(),
            sweep_interval_secs: 60,
        }
    }
}

/// Timestamps admitted for one key
#[derive(Debug, Clone, Default)]
struct RateLimitWindow {
    timestamps: VecDeque<i64>,
    /// After this instant every stored timestamp has left the window
    reset_time: i64,
}

impl RateLimitWindow {
    fn prune(&mut self, config: &RateLimitConfig, now_ms: i64) {
        if now_ms > self.reset_time {
            // Rollover: the whole window has expired.
            self.timestamps.clear();
            return;
        }
        let cutoff = now_ms - config.window_ms as i64;
        while matches!(self.timestamps.front(), Some(&t) if t < cutoff) {
            self.timestamps.pop_front();
        }
    }
}

/// Decision computed by [`evaluate_window`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Requests in the window before this one
    pub count: usize,
    pub remaining: usize,
    pub reset_time: i64,
}

/// Pure sliding-window check over already-pruned timestamps.
///
/// Timestamps must be ascending and all within `[now - window_ms, now]`.
pub fn evaluate_window(timestamps: &[i64], config: &RateLimitConfig, now_ms: i64) -> WindowDecision {
    let count = timestamps.len();
    let window = config.window_ms as i64;

    if count < config.max_requests {
        let oldest = timestamps.first().copied().unwrap_or(now_ms);
        WindowDecision {
            allowed: true,
            count,
            remaining: config.max_requests - count - 1,
            reset_time: oldest + window,
        }
    } else {
        // The oldest admitted request is the first to leave the window.
        let oldest = timestamps
            .get(count - config.max_requests)
            .copied()
            .unwrap_or(now_ms);
        WindowDecision {
            allowed: false,
            count,
            remaining: 0,
            reset_time: oldest + window,
        }
    }
}

/// How a policy derives its limiter key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStrategy {
    /// One window per caller identity
    PerIdentity,
    /// A single window shared by all callers of the endpoint
    Global,
}

/// Declarative rate-limit policy applied at a call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub endpoint: String,
    /// Overrides the endpoint's registered limit when set
    pub config: Option<RateLimitConfig>,
    pub key_strategy: KeyStrategy,
}

impl RateLimitPolicy {
    pub fn per_identity(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            config: None,
            key_strategy: KeyStrategy::PerIdentity,
        }
    }

    pub fn global(endpoint: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config: Some(config),
            key_strategy: KeyStrategy::Global,
        }
    }

    /// Identity the limiter should count this call against.
    pub fn identity_for<'a>(&self, caller: &'a str) -> &'a str {
        match self.key_strategy {
            KeyStrategy::PerIdentity => caller,
            KeyStrategy::Global => "global",
        }
    }
}

/// Replace characters outside `[A-Za-z0-9_.:@-]` and bound the length.
pub fn sanitize_identity(identity: &str) -> String {
    let sanitized: String = identity
        .trim()
        .chars()
        .take(MAX_IDENTITY_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '@' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "anonymous".to_string()
    } else {
        sanitized
    }
}

fn window_key(identity: &str, endpoint: &str) -> String {
    format!("rate_limit:{}:{}", sanitize_identity(endpoint), sanitize_identity(identity))
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Concurrency-safe sliding-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, RateLimitWindow>>,
    endpoint_limits: Arc<RwLock<HashMap<String, RateLimitConfig>>>,
    config: RateLimiterConfig,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let endpoint_limits = Arc::new(RwLock::new(config.endpoint_limits.clone()));
        Self {
            windows: Arc::new(DashMap::new()),
            endpoint_limits,
            config,
        }
    }

    /// Register or override the default limit for an endpoint.
    pub fn register_endpoint(&self, endpoint: &str, config: RateLimitConfig) {
        log::info!(
            "Rate limit for '{}' set to {} requests per {}ms",
            endpoint, config.max_requests, config.window_ms
        );
        self.endpoint_limits.write().insert(endpoint.to_string(), config);
    }

    /// Limit that applies to `endpoint` when the caller does not pass one.
    pub fn endpoint_config(&self, endpoint: &str) -> RateLimitConfig {
        self.endpoint_limits
            .read()
            .get(endpoint)
            .copied()
            .unwrap_or(self.config.fallback)
    }

    /// Check the window and consume a slot when allowed.
    pub fn check_and_consume(
        &self,
        identity: &str,
        endpoint: &str,
        config: Option<RateLimitConfig>,
    ) -> RateLimitResult {
        self.check_and_consume_at(identity, endpoint, config, now_ms())
    }

    pub fn check_and_consume_at(
        &self,
        identity: &str,
        endpoint: &str,
        config: Option<RateLimitConfig>,
        now_ms: i64,
    ) -> RateLimitResult {
        let config = config.unwrap_or_else(|| self.endpoint_config(endpoint));
        let mut window = self
            .windows
            .entry(window_key(identity, endpoint))
            .or_default();

        window.prune(&config, now_ms);
        let decision = evaluate_window(window.timestamps.make_contiguous(), &config, now_ms);

        if decision.allowed {
            window.timestamps.push_back(now_ms);
            window.reset_time = now_ms + config.window_ms as i64;
            RateLimitResult {
                allowed: true,
                remaining: decision.remaining,
                reset_time: decision.reset_time,
                total_hits: decision.count + 1,
            }
        } else {
            log::debug!(
                "Rate limit reached for {}:{} ({} hits)",
                endpoint, sanitize_identity(identity), decision.count
            );
            RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time: decision.reset_time,
                total_hits: decision.count,
            }
        }
    }

    /// Like [`check_and_consume`](Self::check_and_consume) but fails with `RateLimited`.
    pub fn enforce(
        &self,
        identity: &str,
        endpoint: &str,
        config: Option<RateLimitConfig>,
    ) -> PipelineResult<RateLimitResult> {
        self.enforce_at(identity, endpoint, config, now_ms())
    }

    pub fn enforce_at(
        &self,
        identity: &str,
        endpoint: &str,
        config: Option<RateLimitConfig>,
        now_ms: i64,
    ) -> PipelineResult<RateLimitResult> {
        let result = self.check_and_consume_at(identity, endpoint, config, now_ms);
        if result.allowed {
            Ok(result)
        } else {
            Err(PipelineError::RateLimited {
                retry_after_seconds: result.retry_after_seconds(now_ms),
            })
        }
    }

    /// Apply a policy for `caller` at the current time.
    pub fn guard(&self, policy: &RateLimitPolicy, caller: &str) -> PipelineResult<RateLimitResult> {
        self.guard_at(policy, caller, now_ms())
    }

    pub fn guard_at(
        &self,
        policy: &RateLimitPolicy,
        caller: &str,
        now_ms: i64,
    ) -> PipelineResult<RateLimitResult> {
        self.enforce_at(policy.identity_for(caller), &policy.endpoint, policy.config, now_ms)
    }

    /// Non-consuming view of a key's window.
    pub fn status(&self, identity: &str, endpoint: &str) -> RateLimitResult {
        self.status_at(identity, endpoint, now_ms())
    }

    pub fn status_at(&self, identity: &str, endpoint: &str, now_ms: i64) -> RateLimitResult {
        let config = self.endpoint_config(endpoint);
        let key = window_key(identity, endpoint);

        let Some(mut window) = self.windows.get_mut(&key) else {
            return RateLimitResult {
                allowed: config.max_requests > 0,
                remaining: config.max_requests,
                reset_time: now_ms + config.window_ms as i64,
                total_hits: 0,
            };
        };

        window.prune(&config, now_ms);
        let decision = evaluate_window(window.timestamps.make_contiguous(), &config, now_ms);

        RateLimitResult {
            allowed: decision.allowed,
            remaining: config.max_requests.saturating_sub(decision.count),
            reset_time: decision.reset_time,
            total_hits: decision.count,
        }
    }

    /// Whether `identity` has no budget left on `endpoint` right now.
    pub fn is_exhausted(&self, identity: &str, endpoint: &str) -> bool {
        !self.status(identity, endpoint).allowed
    }

    /// Clear a single key.
    pub fn reset(&self, identity: &str, endpoint: &str) {
        self.windows.remove(&window_key(identity, endpoint));
    }

    /// Drop windows whose timestamps have all expired.
    pub fn sweep_idle_at(&self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| now_ms <= window.reset_time);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            log::debug!("Rate limiter swept {} idle windows", removed);
        }
        removed
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Spawn the periodic idle-window sweep.
    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                limiter.sweep_idle_at(now_ms());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::default()
    }

    #[test]
    fn test_two_per_second_scenario() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(2, 1000));
        let start = 1_700_000_000_000;

        let results: Vec<bool> = [0, 40, 90]
            .iter()
            .map(|offset| limiter.check_and_consume_at("alice", "search", config, start + offset).allowed)
            .collect();

        assert_eq!(results, vec![true, true, false]);
    }

    #[test]
    fn test_remaining_and_total_hits() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(3, 1000));
        let t = 10_000;

        let first = limiter.check_and_consume_at("bob", "x", config, t);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.total_hits, 1);
        assert_eq!(first.reset_time, t + 1000);

        let second = limiter.check_and_consume_at("bob", "x", config, t + 10);
        assert_eq!(second.remaining, 1);
        assert_eq!(second.total_hits, 2);
    }

    #[test]
    fn test_rejection_does_not_consume() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(1, 1000));

        assert!(limiter.check_and_consume_at("c", "x", config, 0).allowed);
        for offset in 1..10 {
            let denied = limiter.check_and_consume_at("c", "x", config, offset * 50);
            assert!(!denied.allowed);
            assert_eq!(denied.total_hits, 1);
        }

        // The single admitted request is still counted at t=1000 and gone after.
        assert!(!limiter.check_and_consume_at("c", "x", config, 1000).allowed);
        assert!(limiter.check_and_consume_at("c", "x", config, 1001).allowed);
    }

    #[test]
    fn test_sliding_window_never_exceeds_cap() {
        let limiter = limiter();
        let config = RateLimitConfig::new(5, 1000);
        let mut admitted = Vec::new();

        // Deterministic pseudo-random arrivals over 10 seconds.
        let mut t: i64 = 0;
        let mut seed: u64 = 42;
        while t < 10_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            t += (seed >> 58) as i64 * 10;
            if limiter.check_and_consume_at("d", "x", Some(config), t).allowed {
                admitted.push(t);
            }
        }

        for (i, &start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&ts| ts <= start + config.window_ms as i64)
                .count();
            assert!(in_window <= config.max_requests, "window at {} holds {}", start, in_window);
        }
        assert!(!admitted.is_empty());
    }

    #[test]
    fn test_window_rollover_restarts_empty() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(2, 1000));

        limiter.check_and_consume_at("e", "x", config, 0);
        limiter.check_and_consume_at("e", "x", config, 500);
        assert!(!limiter.check_and_consume_at("e", "x", config, 900).allowed);

        let after = limiter.check_and_consume_at("e", "x", config, 5000);
        assert!(after.allowed);
        assert_eq!(after.total_hits, 1);
        assert_eq!(after.remaining, 1);
    }

    #[test]
    fn test_enforce_carries_retry_after() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(1, 10_000));

        limiter.enforce_at("f", "x", config, 0).unwrap();
        let err = limiter.enforce_at("f", "x", config, 2_500).unwrap_err();
        assert_eq!(err, PipelineError::RateLimited { retry_after_seconds: 8 });
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(1, 1000));

        assert!(limiter.check_and_consume_at("g", "a", config, 0).allowed);
        assert!(limiter.check_and_consume_at("g", "b", config, 0).allowed);
        assert!(limiter.check_and_consume_at("h", "a", config, 0).allowed);
        assert!(!limiter.check_and_consume_at("g", "a", config, 1).allowed);
    }

    #[test]
    fn test_identity_sanitization() {
        assert_eq!(sanitize_identity("user@example.com"), "user@example.com");
        assert_eq!(sanitize_identity("a b*c\n"), "a_b_c");
        assert_eq!(sanitize_identity("rate_limit:*"), "rate_limit:_");
        assert_eq!(sanitize_identity("   "), "anonymous");
        assert_eq!(sanitize_identity(&"x".repeat(500)).len(), MAX_IDENTITY_LEN);
    }

    #[test]
    fn test_registered_endpoint_defaults() {
        let limiter = limiter();
        assert_eq!(limiter.endpoint_config(BATCH_ENDPOINT), RateLimitConfig::new(5, 60_000));
        assert_eq!(limiter.endpoint_config("unknown"), RateLimitConfig::default());

        limiter.register_endpoint("unknown", RateLimitConfig::new(1, 100));
        assert!(limiter.check_and_consume_at("i", "unknown", None, 0).allowed);
        assert!(!limiter.check_and_consume_at("i", "unknown", None, 50).allowed);
    }

    #[test]
    fn test_status_is_non_consuming() {
        let limiter = limiter();
        limiter.register_endpoint("peek", RateLimitConfig::new(2, 1000));

        let untouched = limiter.status_at("j", "peek", 0);
        assert!(untouched.allowed);
        assert_eq!(untouched.remaining, 2);

        limiter.check_and_consume_at("j", "peek", None, 0);
        for _ in 0..5 {
            let status = limiter.status_at("j", "peek", 10);
            assert_eq!(status.remaining, 1);
            assert_eq!(status.total_hits, 1);
        }

        limiter.check_and_consume_at("j", "peek", None, 20);
        assert!(!limiter.status_at("j", "peek", 30).allowed);
    }

    #[test]
    fn test_policy_guard() {
        let limiter = limiter();
        let policy = RateLimitPolicy::global("reports", RateLimitConfig::new(1, 1000));

        assert!(limiter.guard_at(&policy, "alice", 0).is_ok());
        // Global policies share one window across callers.
        assert!(matches!(
            limiter.guard_at(&policy, "bob", 10),
            Err(PipelineError::RateLimited { .. })
        ));

        let per_user = RateLimitPolicy {
            config: Some(RateLimitConfig::new(1, 1000)),
            ..RateLimitPolicy::per_identity("reports-user")
        };
        assert!(limiter.guard_at(&per_user, "alice", 0).is_ok());
        assert!(limiter.guard_at(&per_user, "bob", 0).is_ok());
    }

    #[test]
    fn test_evaluate_window_is_pure() {
        let config = RateLimitConfig::new(2, 1000);
        let decision = evaluate_window(&[100, 200], &config, 300);
        assert!(!decision.allowed);
        assert_eq!(decision.reset_time, 1100);

        let decision = evaluate_window(&[100], &config, 300);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_sweep_idle_windows() {
        let limiter = limiter();
        let config = Some(RateLimitConfig::new(5, 1000));
        limiter.check_and_consume_at("k", "x", config, 0);
        limiter.check_and_consume_at("l", "x", config, 900);

        assert_eq!(limiter.sweep_idle_at(1500), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_result_serialized_shape() {
        let result = RateLimitResult {
            allowed: true,
            remaining: 4,
            reset_time: 1234,
            total_hits: 1,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["remaining"], 4);
        assert_eq!(json["resetTime"], 1234);
        assert_eq!(json["totalHits"], 1);

        let headers = result.headers(5);
        assert_eq!(headers[0], ("X-RateLimit-Limit", "5".to_string()));
    }

    #[test]
    fn test_sweep_racing_checks_never_doubles_the_cap() {
        let config = Some(RateLimitConfig::new(1, 1000));

        for round in 0..50 {
            let limiter = limiter();
            let identity = format!("race-{}", round);
            // An expired window the sweep is allowed to drop at t=1000.
            limiter.check_and_consume_at(&identity, "x", config, -500);

            let barrier = std::sync::Barrier::new(5);
            let admitted = std::sync::atomic::AtomicUsize::new(0);
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        barrier.wait();
                        for _ in 0..50 {
                            if limiter.check_and_consume_at(&identity, "x", config, 1000).allowed {
                                admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            }
                        }
                    });
                }
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..200 {
                        limiter.sweep_idle_at(1000);
                    }
                });
            });

            assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 1, "round {}", round);
        }
    }

    #[test]
    fn test_window_is_closed_at_its_start() {
        let limiter = limiter();
        limiter.register_endpoint("closed", RateLimitConfig::new(1, 1000));
        limiter.check_and_consume_at("m", "closed", None, 0);

        // A request exactly window_ms old still counts.
        assert_eq!(limiter.status_at("m", "closed", 1000).total_hits, 1);
        assert_eq!(limiter.status_at("m", "closed", 1001).total_hits, 0);
    }
}
