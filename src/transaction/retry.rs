//! Retry policy for conflicted units of work.
//!
//! Only store-reported conflicts (deadlock, serialization failure, lock wait
//! timeout) are retried. Validation and connection failures are returned to
//! the caller on the first occurrence.

use std::time::Duration;

use crate::config::ControllerConfig;
use crate::transaction::error::TransactionError;

/// Attempt budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt and is at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Cap each individual delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Check whether a failure is worth another attempt.
    pub fn is_retryable(&self, err: &TransactionError) -> bool {
        err.is_retryable()
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, saturating, capped by the max delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Check whether another attempt fits in the budget after `attempt` failed.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Progress of one retried call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// attempts started so far
    pub attempt: u32,
    /// time spent sleeping between attempts
    pub total_delay: Duration,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of the next attempt; returns its number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn record_delay(&mut self, delay: Duration) {
        self.total_delay += delay;
    }
}
