//! Retry policy: decides whether a failed delivery runs again and when.

use crate::services::pipeline::{ErrorClass, PipelineError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per event, the first delivery included.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier between consecutive retries.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    ///
    /// `attempts` is the number of attempts already made (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Terminal errors are never retried; transient ones until the attempt
    /// budget is spent.
    pub fn decide(&self, error: &PipelineError, attempts: u32) -> RetryDecision {
        match error.class() {
            ErrorClass::Terminal => RetryDecision::GiveUp,
            ErrorClass::Transient if attempts >= self.max_attempts => RetryDecision::GiveUp,
            ErrorClass::Transient => RetryDecision::RetryAfter(self.next_delay(attempts)),
        }
    }
}
