//! # Circuit Breaker
//!
//! Guards calls to an unreliable dependency with the classic three-state
//! machine:
//!
//! ```text
//! CLOSED --failures >= threshold--> OPEN --recovery timeout--> HALF_OPEN
//! HALF_OPEN --success--> CLOSED
//! HALF_OPEN --failure--> OPEN
//! ```
//!
//! State is tracked per key. Each key has its own mutex, held only while
//! admitting a call or recording its outcome; the guarded operation itself
//! runs without any lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is allowed
    pub recovery_timeout_ms: u64,
    /// Concurrent trial calls admitted while HALF_OPEN
    pub half_open_max_calls: u32,
    /// Trial successes required to close again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
    }
}

/// Point-in-time view of one key's breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    /// Milliseconds until a trial call is allowed, when OPEN
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Releases a half-open trial slot if the call never reported an outcome,
/// e.g. because the future was dropped by a deadline.
struct TrialPermit {
    slot: Arc<Mutex<BreakerState>>,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        if self.admission == Admission::Trial && !self.settled {
            let mut state = self.slot.lock();
            if state.state == CircuitState::HalfOpen {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

/// Whether an error says something about the dependency's health.
fn counts_as_failure(error: &PipelineError) -> bool {
    !matches!(
        error,
        PipelineError::RateLimited { .. }
            | PipelineError::CircuitOpen { .. }
            | PipelineError::InvalidInput { .. }
    )
}

/// Per-key circuit breakers sharing one configuration
#[derive(Clone)]
pub struct CircuitBreaker {
    breakers: Arc<DashMap<String, Arc<Mutex<BreakerState>>>>,
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker for `key`.
    ///
    /// Fails fast with `CircuitOpen` without invoking `operation` while the
    /// circuit is open or the half-open trial slots are taken.
    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> PipelineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let slot = self.slot(key);
        let admission = self.admit(key, &slot)?;
        let mut permit = TrialPermit {
            slot: Arc::clone(&slot),
            admission,
            settled: false,
        };

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(key, &slot, admission),
            Err(error) if counts_as_failure(error) => self.record_failure(key, &slot, admission),
            Err(_) => self.record_neutral(&slot, admission),
        }
        permit.settled = true;

        result
    }

    /// Current state, applying the OPEN → HALF_OPEN timeout lazily.
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).state
    }

    pub fn snapshot(&self, key: &str) -> CircuitSnapshot {
        let slot = self.slot(key);
        let mut state = slot.lock();
        let now = Instant::now();
        self.maybe_half_open(key, &mut state, now);

        CircuitSnapshot {
            key: key.to_string(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            rejected_calls: state.rejected_calls,
            retry_after_ms: match state.state {
                CircuitState::Open => Some(self.remaining_open_ms(&state, now)),
                _ => None,
            },
        }
    }

    /// Force a key back to CLOSED.
    pub fn reset(&self, key: &str) {
        let slot = self.slot(key);
        slot.lock().close();
        log::info!("Circuit '{}' reset to CLOSED", key);
    }

    /// Force a key OPEN, e.g. during a known provider outage.
    pub fn force_open(&self, key: &str) {
        let slot = self.slot(key);
        slot.lock().open(Instant::now());
        log::warn!("Circuit '{}' forced OPEN", key);
    }

    fn slot(&self, key: &str) -> Arc<Mutex<BreakerState>> {
        Arc::clone(
            self.breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new())))
                .value(),
        )
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recovery_timeout_ms)
    }

    fn remaining_open_ms(&self, state: &BreakerState, now: Instant) -> u64 {
        state
            .opened_at
            .map(|opened| {
                self.recovery_timeout()
                    .saturating_sub(now.saturating_duration_since(opened))
                    .as_millis() as u64
            })
            .unwrap_or(0)
    }

    fn maybe_half_open(&self, key: &str, state: &mut BreakerState, now: Instant) {
        if state.state != CircuitState::Open {
            return;
        }
        let elapsed = state
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or_default();
        if elapsed >= self.recovery_timeout() {
            state.state = CircuitState::HalfOpen;
            state.half_open_in_flight = 0;
            state.half_open_successes = 0;
            log::info!("Circuit '{}' HALF_OPEN after {:?}", key, elapsed);
        }
    }

    fn admit(&self, key: &str, slot: &Arc<Mutex<BreakerState>>) -> PipelineResult<Admission> {
        let mut state = slot.lock();
        let now = Instant::now();
        self.maybe_half_open(key, &mut state, now);

        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                state.rejected_calls += 1;
                Err(PipelineError::CircuitOpen {
                    key: key.to_string(),
                    retry_after_ms: self.remaining_open_ms(&state, now),
                })
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight < self.config.half_open_max_calls.max(1) {
                    state.half_open_in_flight += 1;
                    Ok(Admission::Trial)
                } else {
                    state.rejected_calls += 1;
                    Err(PipelineError::CircuitOpen {
                        key: key.to_string(),
                        retry_after_ms: self.config.recovery_timeout_ms,
                    })
                }
            }
        }
    }

    fn record_success(&self, key: &str, slot: &Arc<Mutex<BreakerState>>, admission: Admission) {
        let mut state = slot.lock();
        state.total_successes += 1;

        match (admission, state.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.success_threshold.max(1) {
                    state.close();
                    log::info!("Circuit '{}' CLOSED after successful trial", key);
                }
            }
            (_, CircuitState::Closed) => state.consecutive_failures = 0,
            // A call admitted before the circuit opened does not close it.
            _ => {}
        }
    }

    fn record_failure(&self, key: &str, slot: &Arc<Mutex<BreakerState>>, admission: Admission) {
        let mut state = slot.lock();
        let now = Instant::now();
        state.total_failures += 1;
        state.last_failure = Some(now);

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.open(now);
                    log::warn!(
                        "Circuit '{}' OPEN after {} consecutive failures",
                        key, state.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.consecutive_failures += 1;
                state.open(now);
                log::warn!(
                    "Circuit '{}' re-opened after failed {}",
                    key,
                    if admission == Admission::Trial { "trial" } else { "call" }
                );
            }
            CircuitState::Open => {
                state.consecutive_failures += 1;
            }
        }
    }

    fn record_neutral(&self, slot: &Arc<Mutex<BreakerState>>, admission: Admission) {
        if admission == Admission::Trial {
            let mut state = slot.lock();
            if state.state == CircuitState::HalfOpen {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_ms: recovery_ms,
            ..CircuitBreakerConfig::default()
        })
    }

    async fn fail(cb: &CircuitBreaker, key: &str, calls: &AtomicUsize) -> PipelineResult<()> {
        cb.execute(key, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(PipelineError::provider("503", true))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, key: &str, calls: &AtomicUsize) -> PipelineResult<u32> {
        cb.execute(key, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(3, 1_000);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb, "p", &calls).await, Err(PipelineError::ProviderFailure { .. })));
        }
        assert_eq!(cb.state("p"), CircuitState::Open);

        let result = succeed(&cb, "p", &calls).await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "operation must not run while open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_recovery_timeout() {
        let cb = breaker(1, 1_000);
        let calls = AtomicUsize::new(0);

        fail(&cb, "p", &calls).await.unwrap_err();
        for _ in 0..10 {
            assert!(succeed(&cb, "p", &calls).await.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(cb.state("p"), CircuitState::HalfOpen);

        assert_eq!(succeed(&cb, "p", &calls).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cb.state("p"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 500);
        let calls = AtomicUsize::new(0);

        fail(&cb, "p", &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(600)).await;

        fail(&cb, "p", &calls).await.unwrap_err();
        assert_eq!(cb.state("p"), CircuitState::Open);

        let snapshot = cb.snapshot("p");
        assert!(snapshot.retry_after_ms.unwrap() > 0);
        assert!(matches!(succeed(&cb, "p", &calls).await, Err(PipelineError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_only_bounded_trials() {
        let cb = breaker(1, 100);
        let calls = AtomicUsize::new(0);
        fail(&cb, "p", &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(150)).await;

        let cb_trial = cb.clone();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = tokio::spawn(async move {
            cb_trial
                .execute("p", || async move {
                    let _ = release_rx.await;
                    Ok(1)
                })
                .await
        });
        tokio::task::yield_now().await;

        // The trial slot is taken; everyone else fails fast.
        assert!(matches!(succeed(&cb, "p", &calls).await, Err(PipelineError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(cb.state("p"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let cb = breaker(1, 100);
        let calls = AtomicUsize::new(0);
        fail(&cb, "p", &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(150)).await;

        let pending = cb.execute("p", || std::future::pending::<PipelineResult<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(succeed(&cb, "p", &calls).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1_000);
        let calls = AtomicUsize::new(0);

        fail(&cb, "p", &calls).await.unwrap_err();
        fail(&cb, "p", &calls).await.unwrap_err();
        succeed(&cb, "p", &calls).await.unwrap();
        fail(&cb, "p", &calls).await.unwrap_err();
        fail(&cb, "p", &calls).await.unwrap_err();

        assert_eq!(cb.state("p"), CircuitState::Closed);
        assert_eq!(cb.snapshot("p").consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_errors_are_not_failures() {
        let cb = breaker(1, 1_000);
        let result: PipelineResult<()> = cb
            .execute("p", || async { Err(PipelineError::RateLimited { retry_after_seconds: 1 }) })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.state("p"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let cb = breaker(1, 60_000);
        let calls = AtomicUsize::new(0);

        fail(&cb, "a", &calls).await.unwrap_err();
        assert_eq!(cb.state("a"), CircuitState::Open);
        assert_eq!(cb.state("b"), CircuitState::Closed);
        assert!(succeed(&cb, "b", &calls).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_multiple_trials() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 100,
            half_open_max_calls: 1,
            success_threshold: 2,
        });
        let calls = AtomicUsize::new(0);

        fail(&cb, "p", &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(150)).await;

        succeed(&cb, "p", &calls).await.unwrap();
        assert_eq!(cb.state("p"), CircuitState::HalfOpen);
        succeed(&cb, "p", &calls).await.unwrap();
        assert_eq!(cb.state("p"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let cb = breaker(5, 60_000);
        cb.force_open("p");
        assert_eq!(cb.state("p"), CircuitState::Open);
        cb.reset("p");
        assert_eq!(cb.state("p"), CircuitState::Closed);
    }
}
