//! Circuit breaker guarding the sink.
//!
//! Repeated `SinkUnavailable` failures across events open the breaker. While
//! open, nothing is written and nothing is discarded: the owning worker pauses
//! consumption and periodically probes the store. A successful probe moves the
//! breaker to half-open, where real writes decide whether it closes again.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Writes proceed normally
    Closed,
    /// Writes are paused until a probe succeeds
    Open,
    /// Probe succeeded; writes are let through to confirm recovery
    HalfOpen,
}

impl CircuitState {
    /// Numeric value exported as a gauge.
    pub fn as_gauge(&self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time between probes while open
    pub reset_timeout: Duration,

    /// Successes required in half-open to close
    pub success_threshold: u32,

    /// Name for logging
    pub name: String,
}

impl CircuitBreakerConfig {
    /// Create a configuration with default thresholds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            name: name.into(),
        }
    }

    /// Set failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the probe interval.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set success threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new("sink")
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// When the breaker opened or last failed a probe
    opened_at: Option<Instant>,
}

/// Probe-driven circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    opened_total: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!(name = %config.name, "Circuit breaker created");
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
            opened_total: AtomicU64::new(0),
        }
    }

    /// Whether writes may be attempted.
    pub fn is_allowed(&self) -> bool {
        !matches!(self.state.lock().state, CircuitState::Open)
    }

    /// Whether the breaker is open and the probe interval has elapsed.
    pub fn probe_due(&self) -> bool {
        let state = self.state.lock();
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(at)) => at.elapsed() >= self.config.reset_timeout,
            _ => false,
        }
    }

    /// Time left until the next probe (zero when not open or already due).
    pub fn time_until_probe(&self) -> Duration {
        let state = self.state.lock();
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(at)) => self.config.reset_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Record the outcome of a health probe taken while open.
    pub fn record_probe(&self, healthy: bool) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Open {
            return;
        }

        if healthy {
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            info!(name = %self.config.name, "Probe succeeded, circuit breaker half-open");
        } else {
            state.opened_at = Some(Instant::now());
            debug!(name = %self.config.name, "Probe failed, circuit breaker stays open");
        }
    }

    /// Record a successful write.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                    info!(name = %self.config.name, "Circuit breaker closed (recovered)");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a retryable write failure.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                self.opened_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    name = %self.config.name,
                    failures = state.failure_count,
                    "Circuit breaker opened, pausing consumption"
                );
            }
            CircuitState::Closed => {
                debug!(
                    name = %self.config.name,
                    failures = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker recorded failure"
                );
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.success_count = 0;
                state.opened_at = Some(Instant::now());
                self.opened_total.fetch_add(1, Ordering::Relaxed);
                warn!(name = %self.config.name, "Circuit breaker reopened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Number of times the breaker has opened.
    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Probe interval.
    pub fn reset_timeout(&self) -> Duration {
        self.config.reset_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("test")
                .with_failure_threshold(threshold)
                .with_reset_timeout(reset)
                .with_success_threshold(2),
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());
        assert!(!cb.probe_due());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_allowed());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
        assert_eq!(cb.opened_total(), 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(3, Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stays_open_until_probe_succeeds() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        assert!(!cb.probe_due());

        std::thread::sleep(Duration::from_millis(15));
        // Elapsed time alone does not let writes through.
        assert!(!cb.is_allowed());
        assert!(cb.probe_due());

        cb.record_probe(false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.probe_due());

        std::thread::sleep(Duration::from_millis(15));
        cb.record_probe(true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_allowed());
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        cb.record_probe(true);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        cb.record_probe(true);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.opened_total(), 2);
    }

    #[test]
    fn test_probe_ignored_when_closed() {
        let cb = breaker(3, Duration::ZERO);
        cb.record_probe(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.time_until_probe(), Duration::ZERO);
    }
}
