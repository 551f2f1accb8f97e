//! Count-based circuit breaker
//!
//! ```text
//! ┌─────────┐  failure rate > threshold  ┌────────┐
//! │ CLOSED  │ ─────────────────────────> │  OPEN  │
//! └─────────┘                            └────────┘
//!      ^                                     │
//!      │                                     │ wait duration elapsed
//!      │                                     v
//!      │      trial calls succeed     ┌─────────────┐
//!      └───────────────────────────── │  HALF-OPEN  │
//!                                     └─────────────┘
//!                                            │
//!                          any failure       │
//!                          ──> OPEN ─────────┘
//! ```
//!
//! The failure rate is computed over the outcomes of the last
//! `sliding_window_size` calls, and only once `minimum_number_of_calls`
//! outcomes have been recorded.

use metrics::counter;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// A limited number of trial calls decide whether to close again.
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) above which the circuit opens.
    pub failure_rate_threshold: f64,
    /// Number of most recent outcomes considered.
    pub sliding_window_size: usize,
    /// Outcomes required before the failure rate is evaluated.
    pub minimum_number_of_calls: usize,
    /// How long to stay open before permitting trial calls.
    pub wait_duration_in_open_state: Duration,
    /// Trial calls admitted while half-open.
    pub permitted_calls_in_half_open_state: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            minimum_number_of_calls: 5,
            wait_duration_in_open_state: Duration::from_secs(30),
            permitted_calls_in_half_open_state: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_rate_threshold(mut self, percent: f64) -> Self {
        self.failure_rate_threshold = percent.clamp(0.0, 100.0);
        self
    }

    pub fn with_sliding_window_size(mut self, size: usize) -> Self {
        self.sliding_window_size = size.max(1);
        self
    }

    pub fn with_minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.minimum_number_of_calls = calls;
        self
    }

    pub fn with_wait_duration(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    pub fn with_permitted_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.permitted_calls_in_half_open_state = calls.max(1);
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// `true` marks a failed call
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_calls: u32,
    trial_successes: u32,
}

/// Thread-safe circuit breaker.
///
/// All state lives behind one mutex so transitions are atomic with respect to
/// the outcome that triggered them.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::named("grpc", config)
    }

    /// Breaker whose transitions are logged and counted under `name`
    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = config.sliding_window_size;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(window),
                opened_at: None,
                trial_calls: 0,
                trial_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose wait has elapsed still reports
    /// `Open` until the next permission request moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to run one call.
    ///
    /// Returns `false` when the call must be rejected. A `true` answer must be
    /// followed by `record_success`, `record_failure` or `release_permission`.
    pub fn try_acquire_permission(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            let waited = inner
                .opened_at
                .is_none_or(|at| at.elapsed() >= self.config.wait_duration_in_open_state);
            if !waited {
                return false;
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.trial_calls < self.config.permitted_calls_in_half_open_state {
                    inner.trial_calls += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Give back a permission whose call never completed (e.g. it was cancelled)
    pub fn release_permission(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_calls = inner.trial_calls.saturating_sub(1);
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, false);
                self.evaluate(&mut inner);
            }
            CircuitState::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.permitted_calls_in_half_open_state {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Late result of a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                self.evaluate(&mut inner);
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Failure percentage over the window, `None` below the minimum call count
    pub fn failure_rate(&self) -> Option<f64> {
        let inner = self.lock();
        self.rate(&inner)
    }

    /// Force the breaker back to closed with an empty window
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    // Internal methods

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_outcome(&self, inner: &mut BreakerState, failed: bool) {
        if inner.outcomes.len() == self.config.sliding_window_size {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(failed);
    }

    fn rate(&self, inner: &BreakerState) -> Option<f64> {
        let total = inner.outcomes.len();
        if total == 0 || total < self.config.minimum_number_of_calls {
            return None;
        }
        let failures = inner.outcomes.iter().filter(|failed| **failed).count();
        Some(failures as f64 / total as f64 * 100.0)
    }

    fn evaluate(&self, inner: &mut BreakerState) {
        if let Some(rate) = self.rate(inner) {
            if rate > self.config.failure_rate_threshold {
                tracing::warn!(
                    target: "grpc_client",
                    breaker = %self.name,
                    failure_rate = rate,
                    threshold = self.config.failure_rate_threshold,
                    "Failure rate above threshold"
                );
                self.transition(inner, CircuitState::Open);
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.trial_calls = 0;
        inner.trial_successes = 0;
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.outcomes.clear();
            }
            CircuitState::HalfOpen => {}
        }

        if from != to {
            tracing::warn!(
                target: "grpc_client",
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            );
            counter!(
                "grpc_client_circuit_breaker_transitions_total",
                "breaker" => self.name.clone(),
                "state" => to.as_str()
            )
            .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new().with_wait_duration(Duration::from_millis(20))
    }

    fn record(breaker: &CircuitBreaker, failures: usize, successes: usize) {
        for _ in 0..successes {
            assert!(breaker.try_acquire_permission());
            breaker.record_success();
        }
        for _ in 0..failures {
            assert!(breaker.try_acquire_permission());
            breaker.record_failure();
        }
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.failure_rate(), None);
    }

    #[test]
    fn test_rate_not_evaluated_below_minimum_calls() {
        let breaker = CircuitBreaker::default();
        record(&breaker, 4, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_rate(), None);
    }

    #[test]
    fn test_opens_when_failure_rate_exceeds_threshold() {
        let breaker = CircuitBreaker::default();
        record(&breaker, 5, 0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire_permission());
    }

    #[test]
    fn test_exactly_half_failures_stays_closed() {
        let breaker = CircuitBreaker::default();
        record(&breaker, 5, 5);
        assert_eq!(breaker.failure_rate(), Some(50.0));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_window_slides_over_old_outcomes() {
        let breaker = CircuitBreaker::default();
        record(&breaker, 0, 10);
        assert_eq!(breaker.failure_rate(), Some(0.0));
        // 5 failures push out 5 successes: exactly 50%
        record(&breaker, 5, 0);
        assert_eq!(breaker.failure_rate(), Some(50.0));
        assert_eq!(breaker.state(), CircuitState::Closed);
        record(&breaker, 1, 0);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let breaker = CircuitBreaker::new(fast_config());
        record(&breaker, 5, 0);
        assert!(!breaker.try_acquire_permission());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // only one trial call at a time
        assert!(!breaker.try_acquire_permission());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_rate(), None);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new(fast_config());
        record(&breaker, 5, 0);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire_permission());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire_permission());
    }

    #[test]
    fn test_released_trial_permission_can_be_reacquired() {
        let breaker = CircuitBreaker::new(fast_config());
        record(&breaker, 5, 0);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.try_acquire_permission());
        breaker.release_permission();
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::default();
        record(&breaker, 5, 0);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire_permission());
    }
}
