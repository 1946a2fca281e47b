//! Exponential backoff between connection attempts.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for the reconnect delay.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base unit; the delay for attempt `n` is `unit * 2^n`.
    pub unit: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Delay before retrying after the `attempt`-th consecutive failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^30 units already exceeds any sane cap; avoid overflow.
        let factor = 1u32 << attempt.min(30);
        self.unit.saturating_mul(factor).min(self.max_delay)
    }
}

/// Consecutive-failure counter driving the reconnect delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
}

impl RetryState {
    /// Count a failed discovery, connect, verify or register step.
    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// A registration succeeded; the next failure starts from the smallest delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// A serving session ended; back off once before rediscovering.
    pub fn stream_lost(&mut self) {
        self.attempt = 1;
    }

    pub fn delay(&self, config: &BackoffConfig) -> Duration {
        config.delay(self.attempt)
    }
}

/// Sleep for `delay`, returning `false` if `cancel` fired first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
