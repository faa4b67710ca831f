//! Retry utilities for operations that may fail transiently.
//!
//! Two flavours are used by the actuators:
//! - [`retry_until_timeout`] re-runs an operation at a fixed interval until it
//!   succeeds or a wall-clock budget is spent (artifact cleanup).
//! - [`retry_on_conflict`] re-runs a read-modify-write cycle while the API
//!   server keeps rejecting it with a conflict (status updates).

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{error, warn};

use crate::{CoreError, Result};

/// Fixed interval retry bounded by a wall-clock timeout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between two attempts
    pub interval: Duration,
    /// Total time budget, including the attempts themselves
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn until_timeout(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Re-run `operation` every `policy.interval` until it succeeds.
///
/// An attempt still in flight when the budget runs out is cancelled. The last
/// error of the operation is returned once the budget is spent, or a
/// [`CoreError::Timeout`] if no attempt ever finished.
pub async fn retry_until_timeout<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;
    let mut last_error: Option<CoreError> = None;

    loop {
        attempt += 1;

        match time::timeout_at(deadline, operation()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => {
                if Instant::now() + policy.interval >= deadline {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed, retry budget exhausted"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = policy.interval.as_millis() as u64,
                    "Operation failed, retrying"
                );
                last_error = Some(e);
                time::sleep(policy.interval).await;
            }
            Err(_) => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    "Operation timed out"
                );
                return Err(last_error.unwrap_or_else(|| CoreError::Timeout {
                    what: operation_name.to_string(),
                    after: policy.timeout,
                }));
            }
        }
    }
}

/// Re-run a read-modify-write `operation` while it fails with a conflict.
///
/// Any other error is returned immediately. After `attempts` conflicts the
/// result is [`CoreError::ConflictExhausted`] naming `key`.
pub async fn retry_on_conflict<F, Fut, T>(attempts: u32, key: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=attempts.max(1) {
        match operation().await {
            Err(e) if e.is_conflict() => {
                warn!(key = %key, attempt = attempt, "Conflict while updating, refetching");
            }
            other => return other,
        }
    }

    Err(CoreError::ConflictExhausted(key.to_string()))
}

/// Run `operation` with a local deadline, mapping expiry to [`CoreError::Timeout`]
pub async fn with_deadline<Fut, T>(after: Duration, what: &str, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match time::timeout(after, operation).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            what: what.to_string(),
            after,
        }),
    }
}
