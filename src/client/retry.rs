//! Retry policy and failure classification.

use crate::config::BalancerConfig;
use crate::transport::{Code, Status};
use std::time::Duration;

/// How often and how patiently a call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff. Attempt `n` waits `retry_delay * (n + 1)`.
    pub retry_delay: Duration,
    /// Bound on the whole call, backoffs included. Zero disables it.
    /// A single attempt running past it fails the call without a retry.
    pub failover_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            failover_timeout: config.failover_timeout,
        }
    }

    /// Total attempts per call, the first one included.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pause after failed attempt `attempt` (zero based). Linear in the
    /// attempt number.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt.saturating_add(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BalancerConfig::default())
    }
}

/// Whether a failed attempt may be retried on another (or the same) server.
pub fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unknown
    )
}

/// Whether a failure points at the connection rather than the call.
pub fn is_connection_error(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
}
