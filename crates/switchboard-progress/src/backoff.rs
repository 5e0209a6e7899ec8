use std::time::Duration;

use switchboard_core::config::ProgressConfig;

/// Bounded exponential reconnect schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnects allowed after the first failure before giving up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl From<&ProgressConfig> for ReconnectPolicy {
    fn from(config: &ProgressConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before reconnect attempt `attempt` (0-indexed): `base · 2^attempt`,
    /// capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay after the given number of consecutive failures, or `None` once
    /// the reconnect budget is spent
    pub fn after_failures(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_attempts {
            None
        } else {
            Some(self.delay(failures - 1))
        }
    }
}
