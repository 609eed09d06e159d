//! Retry policy with exponential backoff and jitter.
//!
//! Retries are an explicit value passed to call sites, wrapped around a
//! fallible async operation by [`retry_async`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub base_delay_ms: u64,
    /// Growth factor applied per further attempt.
    pub backoff_multiplier: f64,
    /// Random spread as a fraction of the delay (0.0 = none, 0.5 = ±50%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_attempts(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(u64::MAX as f64) as u64)
    }

    /// Delay with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        base.mul_f64(factor)
    }
}

/// Run `op` until it produces a value `should_retry` rejects, or attempts
/// run out. Returns the last value and the number of attempts made.
pub async fn retry_async<T, F, Fut, P>(policy: &RetryPolicy, should_retry: P, mut op: F) -> (T, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let value = op(attempt).await;
        if attempt >= max_attempts || !should_retry(&value) {
            return (value, attempt);
        }
        let delay = policy.delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
