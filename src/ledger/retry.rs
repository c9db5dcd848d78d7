//! Retry with exponential backoff for idempotent ledger reads.
//!
//! Only [`LedgerError::is_transient`] failures are retried; anything else is
//! returned immediately.

use std::future::Future;

use log::warn;
use rocket::tokio::time::{sleep, Duration};

use super::LedgerError;

/// How many times, and how patiently, to retry a ledger read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry attempts after the initial call.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Never retry.
    pub const NONE: Self = Self {
        max_retries: 0,
        base_delay: Duration::ZERO,
    };

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    /// Delays of 200ms, 400ms, 800ms.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Run the read `f`, retrying transient failures according to `policy`.
///
/// `what` names the read in log messages.
pub async fn retry_read<T, F, Fut>(policy: &RetryPolicy, what: &str, f: F) -> Result<T, LedgerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    for attempt in 0..policy.max_retries {
        match f().await {
            Err(e) if e.is_transient() => {
                let delay = policy.delay(attempt);
                warn!(
                    "Ledger read `{what}` failed (attempt {}/{}), retrying in {delay:?}: {e}",
                    attempt + 1,
                    policy.max_retries + 1
                );
                sleep(delay).await;
            }
            result => return result,
        }
    }
    // Final attempt.
    f().await
}
