//! Retry policies.
//!
//! A [`RetryPolicy`] wraps the handler invocation and decides whether a
//! failed attempt runs again. Each attempt is independently subject to the
//! configured timeout; cancellation stops the policy between attempts.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::logs::TaskLogger;

/// One execution attempt: takes the 1-based attempt number, resolves to the
/// attempt outcome. Attempts own their state so they can be re-invoked.
pub type AttemptFn = dyn Fn(u32) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Decides whether and when failed attempts run again.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Drive `op` to success or give up.
    ///
    /// The policy must not retry once `token` is cancelled; the last attempt
    /// error is returned unchanged so the worker can classify it.
    fn execute<'a>(
        &'a self,
        op: &'a AttemptFn,
        logger: &'a TaskLogger,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Fixed delay, fixed attempt count.
#[derive(Debug, Clone)]
pub struct LinearRetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl LinearRetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for LinearRetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn execute<'a>(
        &'a self,
        op: &'a AttemptFn,
        logger: &'a TaskLogger,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(run_attempts(
            self.max_attempts,
            move |_| self.delay,
            op,
            logger,
            token,
        ))
    }
}

/// Exponential backoff, fixed attempt count. Delays are capped at one hour.
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    factor: f64,
}

const MAX_BACKOFF: Duration = Duration::from_secs(3600);

impl ExponentialRetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            factor: 2.0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled).min(MAX_BACKOFF)
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn execute<'a>(
        &'a self,
        op: &'a AttemptFn,
        logger: &'a TaskLogger,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(run_attempts(
            self.max_attempts,
            move |attempt| self.delay_for(attempt),
            op,
            logger,
            token,
        ))
    }
}

/// Single attempt, no retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn execute<'a>(
        &'a self,
        op: &'a AttemptFn,
        _logger: &'a TaskLogger,
        _token: &'a CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        op(1)
    }
}

async fn run_attempts<'a>(
    max_attempts: u32,
    delay_for: impl Fn(u32) -> Duration + Send + Sync + 'a,
    op: &'a AttemptFn,
    logger: &'a TaskLogger,
    token: &'a CancellationToken,
) -> anyhow::Result<()> {
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(()) => return Ok(()),
            Err(error) => {
                if token.is_cancelled() || attempt >= max_attempts {
                    return Err(error);
                }

                let delay = delay_for(attempt);
                logger.warn(format!(
                    "attempt {attempt}/{max_attempts} failed, retrying in {delay:?}: {error:#}"
                ));
                attempt += 1;

                tokio::select! {
                    _ = token.cancelled() => return Err(error),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
