//! Reconnection policy.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay schedule between connection attempts.
///
/// The default is a fixed 5 second interval with unlimited retries while the
/// broker is unreachable. A multiplier above 1.0 turns it into capped
/// exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Consecutive protocol-level rejections before giving up.
    pub max_rejected_attempts: u32,
    /// Upper bound on a single connection attempt.
    pub attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            multiplier: 1.0,
            max_rejected_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            multiplier: config.multiplier.max(1.0),
            max_rejected_attempts: config.max_rejected_attempts,
            ..Self::default()
        }
    }
}

impl ReconnectPolicy {
    /// Fixed-interval policy, handy for tests and tight loops.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether to try again after `rejected` consecutive rejections.
    pub const fn should_retry_rejected(&self, rejected: u32) -> bool {
        rejected < self.max_rejected_attempts
    }
}
