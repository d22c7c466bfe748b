//! Retry policy shared by the fetch loop and the update dispatcher.
//!
//! Network failures against the manager are never fatal (the worker retries
//! forever), so unlike a reconnection strategy there is no attempt cap here:
//! the policy only answers "how long to wait before attempt N+1".

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay policy applied between retries of a failing network operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay between attempts in milliseconds.
        delay_ms: u64,
    },

    /// Exponential backoff between attempts, capped at a maximum delay.
    ExponentialBackoff {
        /// Delay before the first retry in milliseconds.
        initial_delay_ms: u64,
        /// Maximum delay between attempts in milliseconds.
        max_delay_ms: u64,
        /// Multiplier for each subsequent attempt.
        multiplier: f64,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a fixed delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Creates an exponential backoff policy.
    pub fn exponential_backoff(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self::ExponentialBackoff {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier,
        }
    }

    /// Delay to wait before the given retry attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::ExponentialBackoff {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(attempt as i32);
                Duration::from_millis((delay as u64).min(*max_delay_ms))
            }
        }
    }
}
