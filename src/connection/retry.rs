//! Exponential backoff for connection retries.
//!
//! The delay before retry number `attempt` (0-based) is
//! `min(base_delay * multiplier^attempt, max_delay)`. With `multiplier >= 1`
//! the sequence is non-decreasing and never exceeds `max_delay`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ValidationError;

/// Defines how connection attempts are retried.
///
/// # Example
///
/// ```rust
/// use stage_control::connection::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     base_delay: Duration::from_millis(100),
///     multiplier: 2.0,
///     max_delay: Duration::from_millis(350),
///     max_attempts: 5,
/// };
/// assert_eq!(policy.delay_for(0), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(1), Duration::from_millis(200));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(350));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Growth factor applied per attempt (>= 1)
    pub multiplier: f64,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Total number of connection attempts, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Reject policies whose delays could shrink or never end.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_delay.is_zero() {
            return Err(ValidationError::InvalidConfig(
                "retry.base_delay must be non-zero".to_string(),
            ));
        }
        if !(self.multiplier >= 1.0) || !self.multiplier.is_finite() {
            return Err(ValidationError::InvalidConfig(format!(
                "retry.multiplier must be a finite value >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(ValidationError::InvalidConfig(format!(
                "retry.max_delay {:?} is shorter than retry.base_delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !scaled.is_finite() || scaled >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Stateful iterator over this policy's delays.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Attempt counter paired with a [`RetryPolicy`].
///
/// The counter resets to zero after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Number of failed attempts recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.policy.max_attempts
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget all recorded failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
