//! Generic retry combinator (§9: "Async persistence retry decorators...
//! expose a `with_retry(n, backoff, classify)` combinator").
//!
//! Grounded on the Python source's `tenacity.retry(stop_after_attempt(3),
//! wait_exponential(multiplier=1, min=1, max=10))` decorators used around
//! `update_task_result` and provider calls; re-expressed as an explicit
//! async function rather than a decorator, per spec §9's redesign note on
//! exception-driven control flow.

use std::future::Future;

use tracing::warn;

use crate::error::{EngineError, Result};
use crate::utils::calculate_backoff_delay;

/// Retry `operation` up to `max_attempts` times (first call counts as
/// attempt 1), sleeping `calculate_backoff_delay` seconds between attempts,
/// but only when the returned error `is_transient()`. A non-transient
/// failure returns immediately without retrying.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, base_delay_secs: u64, max_delay_secs: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !err.is_transient() {
                    return Err(err);
                }
                let delay = calculate_backoff_delay(attempt - 1, base_delay_secs, max_delay_secs);
                warn!(attempt, delay_secs = delay, error = %err, "retry attempt failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            }
        }
    }
}

/// Like [`with_retry`] but retries unconditionally (used for persistence
/// writes that are always worth retrying per spec §4.5/§4.8, regardless of
/// error classification).
pub async fn with_retry_unconditional<T, F, Fut>(max_attempts: u32, base_delay_secs: u64, max_delay_secs: u64, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let delay = calculate_backoff_delay(attempt - 1, base_delay_secs, max_delay_secs);
                warn!(attempt, delay_secs = delay, error = %err, "retry attempt failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            }
        }
    }
}
