//! Exponential backoff for push-channel reconnection

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Exponential backoff calculator with jitter.
///
/// The first delay equals `initial_delay_ms`; each following delay grows by
/// `multiplier` until it reaches `max_delay_ms`. Jitter is applied on top of the
/// un-jittered curve so it never compounds across attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    base_delay_ms: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms as f64;
        Self {
            config,
            base_delay_ms: initial,
            attempt: 0,
        }
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        let max = self.config.max_delay_ms as f64;
        let capped_delay = if self.attempt == 0 {
            self.base_delay_ms.min(max)
        } else {
            (self.base_delay_ms * self.config.multiplier.max(1.0)).min(max)
        };
        self.base_delay_ms = capped_delay;
        self.attempt = self.attempt.saturating_add(1);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).max(1.0)
        } else {
            capped_delay.max(1.0)
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.base_delay_ms = self.config.initial_delay_ms as f64;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
