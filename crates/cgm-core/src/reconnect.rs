//! Backoff policy for reconnecting to a streaming sensor.
//!
//! The connection state machine consults [`ReconnectOptions`] after every
//! failed connection attempt. Once `max_attempts` consecutive attempts have
//! failed, the machine gives up on the remembered peripheral and rescans.

use std::time::Duration;

use crate::error::{Error, Result};

/// Options for automatic reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectOptions {
    /// Maximum number of consecutive failed attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (for exponential backoff).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to use exponential backoff.
    pub use_exponential_backoff: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_exponential_backoff: true,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options with unlimited retry attempts.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Create options with a fixed delay (no backoff).
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            use_exponential_backoff: false,
            ..Default::default()
        }
    }

    /// Set maximum number of reconnection attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set initial delay before first reconnection attempt.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between attempts.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier for exponential backoff.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable exponential backoff.
    #[must_use]
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.initial_delay;
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);

        delay.min(self.max_delay)
    }

    /// Whether `failures` consecutive failures exhaust the attempt budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }

    /// Validate the options and return an error if invalid.
    ///
    /// Checks that:
    /// - `backoff_multiplier` is >= 1.0
    /// - `initial_delay` is > 0
    /// - `max_delay` >= `initial_delay`
    /// - `max_attempts`, when set, is > 0
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config("backoff_multiplier must be >= 1.0"));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::invalid_config("initial_delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config("max_delay must be >= initial_delay"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_sequence() {
        let options = ReconnectOptions::default();
        let delays: Vec<_> = (0..8).map(|a| options.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16, 32, 60, 60].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn test_fixed_delay() {
        let options = ReconnectOptions::fixed_delay(Duration::from_secs(3));
        assert_eq!(options.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(options.delay_for_attempt(10), Duration::from_secs(3));
    }

    #[test]
    fn test_huge_attempt_saturates_at_max_delay() {
        let options = ReconnectOptions::default();
        assert_eq!(options.delay_for_attempt(10_000), Duration::from_secs(60));
    }

    #[test]
    fn test_is_exhausted() {
        let options = ReconnectOptions::default();
        assert!(!options.is_exhausted(4));
        assert!(options.is_exhausted(5));
        assert!(!ReconnectOptions::unlimited().is_exhausted(u32::MAX));
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectOptions::default().validate().is_ok());
        assert!(
            ReconnectOptions::default()
                .backoff_multiplier(0.5)
                .validate()
                .is_err()
        );
        assert!(
            ReconnectOptions::default()
                .initial_delay(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            ReconnectOptions::default()
                .initial_delay(Duration::from_secs(120))
                .validate()
                .is_err()
        );
        assert!(ReconnectOptions::default().max_attempts(0).validate().is_err());
    }
}
