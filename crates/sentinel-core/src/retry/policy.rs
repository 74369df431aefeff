//! Exponential backoff policy.

use crate::config::RetryConfig;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// Delay for retry `n` (0-based) is `min(max_delay, base_delay * 2^n)`,
/// optionally spread by ±25% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Attempts allowed per event, including the first
    pub max_attempts: u32,
    /// Whether to add jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts.max(1),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with jitter enabled.
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows_attempt(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << retry.min(20));
        let capped_ms = delay_ms.min(max_ms);

        let final_ms = if self.jitter {
            let range = capped_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (range * 2 + 1);
            capped_ms.saturating_sub(range) + jitter
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }
}
