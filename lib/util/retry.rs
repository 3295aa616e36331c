//! Bounded retry with backoff for remote calls.

use std::{fmt::Display, future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retryability {
    Retryable,
    Fatal,
}

/// Errors that know whether retrying them can help.
pub trait Classify {
    fn retryability(&self) -> Retryability;
}

fn default_backoff() -> u32 {
    1
}

#[serde_as]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "delay_ms")]
    pub delay: Duration,
    /// Factor applied to the delay after each further failure.
    /// `1` keeps the delay fixed.
    #[serde(default = "default_backoff")]
    pub backoff: u32,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: 1,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds, fails with an error `classify` marks fatal,
/// or `policy.max_attempts` attempts have been made. The last error is
/// returned. `op` receives the 1-based attempt number.
pub async fn retry<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: Op,
    classify: C,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Retryability,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if classify(&err) == Retryability::Fatal {
            tracing::debug!(operation, attempt, "{err}; not retryable");
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(err);
        }
        let delay = policy.delay_after(attempt);
        tracing::warn!(
            operation,
            attempt,
            max_attempts,
            "{err}; retrying after {delay:?}"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// [`retry`] for errors implementing [`Classify`].
pub async fn retry_classified<T, E, Op, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: Op,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    retry(policy, operation, op, E::retryability).await
}
