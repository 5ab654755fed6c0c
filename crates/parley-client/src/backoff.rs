//! Reconnect backoff: `base * 2^(attempt-1) + jitter`.

use std::time::Duration;

use parley_settings::ClientSettings;
use rand::Rng;

/// Exponential reconnect schedule with additive jitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    /// Jitter is drawn uniformly from `[0, jitter_max]`.
    pub jitter_max: Duration,
    /// Reconnects allowed before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            jitter_max: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.reconnect_base_ms),
            jitter_max: Duration::from_millis(settings.reconnect_jitter_ms),
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before jitter for a 1-based `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Full delay for `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.jitter()
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
