//! # Retry Policy Module
//!
//! Exponential backoff for failing receive and delete calls.
//!
//! The receive loop never gives up (only cancellation ends it) and uses the
//! policy purely to space out attempts against a failing backend. The delete
//! loop retries transient failures up to `max_attempts` times and then drops
//! the handle, leaving redelivery to the backend.

use crate::error::ConfigurationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with optional jitter. Defaults to 3 attempts, 1s
/// initial delay, 16s cap and a 2.0 multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries for a single delete
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with jitter enabled
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Retry receives straight away and never retry deletes.
    ///
    /// A persistently failing backend turns the receive loop into a busy
    /// loop under this policy.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            use_jitter: false,
            jitter_percent: 0.0,
        }
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Reject policies that cannot produce a usable delay
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "retry backoff_multiplier must be a finite value of at least 1.0, got {}",
                    self.backoff_multiplier
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "retry jitter_percent must be between 0.0 and 1.0, got {}",
                    self.jitter_percent
                ),
            });
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "retry initial_delay ({:?}) must not exceed max_delay ({:?})",
                    self.initial_delay, self.max_delay
                ),
            });
        }
        Ok(())
    }

    /// `initial * multiplier^attempt`, capped at `max_delay`, then jittered
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        // NaN or negative only arise from a policy that skipped validation
        Duration::try_from_secs_f64(final_delay_secs).unwrap_or(self.max_delay)
    }

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);

        (delay_secs + jitter).max(0.0)
    }
}

/// Attempt counter for one failing operation
#[derive(Debug, Clone, Default)]
pub(crate) struct RetryState {
    pub attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// After a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn get_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.calculate_delay(self.attempt)
    }

    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.attempt)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
