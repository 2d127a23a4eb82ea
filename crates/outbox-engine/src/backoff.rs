//! Exponential retry delay.

use std::time::Duration;

use outbox_core::config::DispatchConfig;

/// `delay_for(n) = min(base * 2^n, max)`, saturating instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.base_backoff(), config.max_backoff())
    }

    /// Delay before the next attempt of an action that has already failed
    /// `retry_count` times.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}
