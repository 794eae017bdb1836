//! Fetch backoff.
//!
//! The delay starts at zero. The first failure sets it to the initial delay,
//! each further consecutive failure multiplies it by the growth factor, and
//! every successful fetch decays it by the decay factor. Growth is capped at
//! `max_delay`; a delay that decays below one millisecond snaps back to zero.

use std::time::Duration;

/// Configuration for [`Backoff`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Multiplier applied on each consecutive failure.
    pub growth: f64,
    /// Multiplier applied on each success.
    pub decay: f64,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            growth: 1.5,
            decay: 0.9,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Current backoff delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    delay_ms: f64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            delay_ms: 0.0,
        }
    }

    /// The delay to sleep before the next fetch, rounded to whole milliseconds.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.round() as u64)
    }

    pub fn is_idle(&self) -> bool {
        self.delay_ms == 0.0
    }

    /// Record a failed fetch and return the new delay.
    pub fn on_failure(&mut self) -> Duration {
        let max_ms = self.config.max_delay.as_secs_f64() * 1000.0;
        self.delay_ms = if self.delay_ms == 0.0 {
            self.config.initial_delay.as_secs_f64() * 1000.0
        } else {
            self.delay_ms * self.config.growth
        }
        .min(max_ms);
        self.delay()
    }

    /// Record a successful fetch and return the new delay.
    pub fn on_success(&mut self) -> Duration {
        self.delay_ms *= self.config.decay;
        if self.delay_ms < 1.0 {
            self.delay_ms = 0.0;
        }
        self.delay()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn test_growth_then_decay() {
        let mut backoff = Backoff::default();
        assert!(backoff.is_idle());

        assert_eq!(millis(backoff.on_failure()), 1000);
        assert_eq!(millis(backoff.on_failure()), 1500);
        assert_eq!(millis(backoff.on_failure()), 2250);
        assert_eq!(millis(backoff.on_success()), 2025);
    }

    #[test]
    fn test_success_when_idle_stays_zero() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.on_success(), Duration::ZERO);
        assert!(backoff.is_idle());
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_delay: Duration::from_millis(3000),
            ..Default::default()
        });
        for _ in 0..10 {
            backoff.on_failure();
        }
        assert_eq!(millis(backoff.delay()), 3000);
    }

    #[test]
    fn test_decay_snaps_to_zero() {
        let mut backoff = Backoff::default();
        backoff.on_failure();
        // 1000 * 0.9^66 is below one millisecond.
        for _ in 0..66 {
            backoff.on_success();
        }
        assert!(backoff.is_idle());

        // The next failure starts over at the initial delay.
        assert_eq!(millis(backoff.on_failure()), 1000);
    }
}
