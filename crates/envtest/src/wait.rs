//! Polling helpers for timing-dependent assessments.
//!
//! Assessments against a live environment often need to wait for something
//! to converge (a pod becoming ready, a metric being scraped). `poll_until`
//! retries a condition with exponential backoff and stops early when the
//! step's context is cancelled.

use crate::context::Context;
use crate::errors::FuncError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Retry schedule for `poll_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Give up once this much time has elapsed.
    pub timeout: Duration,
}

impl Backoff {
    /// Backoff with the default 500ms initial delay and the given timeout.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Poll `condition` until it returns true.
///
/// Delays start at `initial_delay`, double after each attempt and are capped
/// at both `max_delay` and the time remaining before `timeout`.
///
/// # Errors
///
/// - `FuncError::Timeout` if the condition is still false, or an attempt is
///   still pending, at the timeout.
/// - `FuncError::Cancelled` (or the context's own timeout) if `ctx` is done
///   first.
///
/// # Example
///
/// ```no_run
/// use envtest::context::Context;
/// use envtest::wait::{poll_until, Backoff};
/// use std::time::Duration;
///
/// # async fn deployment_ready() -> bool { true }
/// # async fn example(ctx: Context) -> Result<(), envtest::errors::FuncError> {
/// poll_until(&ctx, Backoff::with_timeout(Duration::from_secs(60)), || async {
///     deployment_ready().await
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn poll_until<F, Fut>(
    ctx: &Context,
    backoff: Backoff,
    mut condition: F,
) -> Result<(), FuncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let deadline = start + backoff.timeout;
    let mut delay = backoff.initial_delay;
    let mut attempts: u32 = 0;

    loop {
        ctx.check()?;
        attempts += 1;
        // A single attempt is bounded by both the context and the timeout.
        let met = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            met = condition() => met,
            () = sleep_until(deadline) => {
                tracing::debug!(target: "envtest.wait", attempts, "Attempt still pending at timeout");
                return Err(FuncError::Timeout(backoff.timeout));
            }
        };
        if met {
            tracing::debug!(target: "envtest.wait", attempts, "Condition met");
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= backoff.timeout {
            tracing::debug!(target: "envtest.wait", attempts, "Condition not met before timeout");
            return Err(FuncError::Timeout(backoff.timeout));
        }

        let remaining = backoff.timeout.saturating_sub(elapsed);
        let pause = delay.min(backoff.max_delay).min(remaining);

        tokio::select! {
            () = sleep(pause) => {}
            err = ctx.done() => return Err(err),
        }

        delay = delay.saturating_mul(2);
    }
}
