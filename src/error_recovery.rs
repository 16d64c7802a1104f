//! Bounded retry for hardware reads.
//!
//! Reads are idempotent, so a timed-out or transiently failing read is retried a
//! small fixed number of times with a constant backoff. Writes and motion are never
//! retried here: a failed write aborts the scan.

use crate::config::HardwareConfig;
use crate::error::{AppResult, DaqError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl From<&HardwareConfig> for RetryPolicy {
    fn from(config: &HardwareConfig) -> Self {
        Self {
            max_attempts: config.read_retries.max(1),
            backoff_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`DaqError::is_transient`] errors are retried. When every attempt times
/// out, the returned [`DaqError::DeviceTimeout`] carries the total attempt count.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                tracing::warn!(what, attempt, attempts, error = %err, "transient failure");
                last_error = Some(err);
                if attempt < attempts {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(match last_error {
        Some(DaqError::DeviceTimeout { operation, .. }) => DaqError::timeout(operation, attempts),
        Some(err) => err,
        None => DaqError::timeout(what, attempts),
    })
}
