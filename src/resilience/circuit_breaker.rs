//! Circuit breaker for replica protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: replica assumed down, requests fail fast
//! - Half-Open: a limited number of trial calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: after cooldown elapses (checked lazily)
//! Half-Open → Closed: successes >= success_threshold
//! Half-Open → Open: any failure (cooldown restarts)
//! ```
//!
//! # Design Decisions
//! - Per-endpoint circuit breaker (not global)
//! - Fail fast in Open state; no I/O ever happens inside the breaker
//! - State lives behind one mutex so transitions are never torn
//! - A Half-Open trial slot belongs to a [`CallPermit`]; a permit dropped
//!   without an outcome hands its slot back

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_calls: u32,
    half_open_successes: u32,
    /// Bumped on every Open → Half-Open transition.
    trial_epoch: u64,
    opened_at: Option<Instant>,
}

/// Point-in-time view of a breaker, for stats.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time until an open circuit admits trial calls.
    pub retry_after_ms: Option<u64>,
}

/// Failure tracker and fast-fail gate for one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    half_open_max_calls: u32,
    success_threshold: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            half_open_max_calls: config.half_open_max_calls.max(1),
            success_threshold: config.success_threshold.clamp(1, config.half_open_max_calls.max(1)),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_calls: 0,
                half_open_successes: 0,
                trial_epoch: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move Open → Half-Open once the cooldown has elapsed.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(self.cooldown);
            if elapsed >= self.cooldown {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                inner.half_open_successes = 0;
                inner.trial_epoch += 1;
                tracing::info!("Circuit half-open, admitting trial calls");
            }
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.half_open_calls = 0;
        inner.half_open_successes = 0;
    }

    /// `None` when refused, `Some(None)` in Closed, `Some(Some(epoch))`
    /// when a Half-Open trial slot was taken.
    fn admit(&self) -> Option<Option<u64>> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => None,
            CircuitState::HalfOpen if inner.half_open_calls < self.half_open_max_calls => {
                inner.half_open_calls += 1;
                Some(Some(inner.trial_epoch))
            }
            CircuitState::HalfOpen => None,
        }
    }

    /// Ask permission for one call. In Half-Open this consumes a trial slot
    /// that only a recorded outcome settles; prefer [`CircuitBreaker::try_acquire`].
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Ask permission for one call and hold it as a permit. Dropping the
    /// permit unsettled returns its trial slot.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        self.admit().map(|trial| CallPermit {
            breaker: self.clone(),
            trial,
            settled: false,
        })
    }

    fn release_trial(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_epoch == epoch {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
            tracing::debug!("Trial call abandoned, slot released");
        }
    }

    /// Whether `allow_request` would currently succeed, without consuming
    /// a trial slot.
    pub fn is_available(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => inner.half_open_calls < self.half_open_max_calls,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_calls = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                    tracing::info!("Circuit closed after successful trial calls");
                }
            }
            // Late success from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.open(&mut inner, now);
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        cooldown = ?self.cooldown,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.open(&mut inner, now);
                tracing::warn!("Trial call failed, circuit re-opened");
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Time until an open circuit starts admitting trial calls.
    pub fn retry_after(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.cooldown.saturating_sub(now.saturating_duration_since(at)))
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        let retry_after_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.cooldown
                    .saturating_sub(now.saturating_duration_since(at))
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_after_ms,
        }
    }
}

/// One admitted call. Report its outcome through the permit; a permit
/// dropped without one gives a Half-Open trial slot back.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: Option<u64>,
    settled: bool,
}

impl CallPermit {
    pub fn record_success(&mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn record_failure(&mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if let (false, Some(epoch)) = (self.settled, self.trial) {
            self.breaker.release_trial(epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, trials: u32) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_secs: 60,
            half_open_max_calls: trials,
            success_threshold: trials,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(5, 3);
        for _ in 0..4 {
            cb.record_failure();
            assert!(cb.allow_request());
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(!cb.is_available());
        assert_eq!(cb.retry_after(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exact_trials() {
        let cb = breaker(5, 3);
        for _ in 0..5 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.allow_request());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
        assert!(!cb.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_successes_close() {
        let cb = breaker(2, 3);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        for _ in 0..3 {
            assert!(cb.allow_request());
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_cooldown() {
        let cb = breaker(1, 3);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allow_request());
        cb.record_success();
        assert!(cb.allow_request());
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.allow_request());
        assert_eq!(cb.retry_after(), Some(Duration::from_secs(30)));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_returns_its_slot() {
        let cb = Arc::new(breaker(1, 2));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_none());

        drop(first);
        assert!(cb.is_available());
        drop(second);

        for _ in 0..2 {
            cb.try_acquire().unwrap().record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_does_not_free_a_newer_trial() {
        let cb = Arc::new(breaker(1, 1));
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        let stale = cb.try_acquire().unwrap();

        // Another trial fails; the circuit reopens and later half-opens again.
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        let current = cb.try_acquire().unwrap();
        drop(stale);
        assert!(!cb.is_available());

        drop(current);
        assert!(cb.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_permit_drop_is_a_no_op() {
        let cb = Arc::new(breaker(2, 1));
        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }
}
