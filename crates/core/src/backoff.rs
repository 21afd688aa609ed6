//! Exponential-backoff schedule for live-channel reconnects.
//!
//! The supervisor asks [`Backoff::next_delay`] for the wait before each
//! automatic reconnect and calls [`Backoff::reset`] whenever a connection
//! succeeds or the user forces a reconnect.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up on the push channel.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(15_000),
            multiplier: 1.8,
            max_attempts: None,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// Fractional milliseconds are truncated and the result is clamped to
/// [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier).floor() as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Stateful backoff schedule for one supervised job.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_delay(self.current, &self.config);
        self.failures += 1;
        delay
    }

    /// Return to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the configured attempt ceiling has been reached.
    pub fn exhausted(&self) -> bool {
        self.config
            .max_attempts
            .is_some_and(|max| self.failures >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn next_delay_multiplies() {
        let config = ReconnectConfig::default();
        assert_eq!(next_delay(ms(1000), &config), ms(1800));
    }

    #[test]
    fn next_delay_truncates_fractions() {
        let config = ReconnectConfig::default();
        assert_eq!(next_delay(ms(5832), &config), ms(10_497));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig::default();
        assert_eq!(next_delay(ms(10_497), &config), ms(15_000));
        assert_eq!(next_delay(ms(15_000), &config), ms(15_000));
    }

    #[test]
    fn full_backoff_sequence() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        let expected = [1000, 1800, 3240, 5832, 10_497, 15_000, 15_000];

        for &expected_ms in &expected {
            assert_eq!(backoff.next_delay(), ms(expected_ms));
        }
        assert_eq!(backoff.failures(), expected.len() as u32);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), ms(1000));
    }

    #[test]
    fn unbounded_by_default() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        for _ in 0..100 {
            backoff.next_delay();
        }
        assert!(!backoff.exhausted());
    }

    #[test]
    fn exhausted_after_ceiling() {
        let mut backoff = Backoff::new(ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        });
        backoff.next_delay();
        assert!(!backoff.exhausted());
        backoff.next_delay();
        assert!(backoff.exhausted());
    }
}
