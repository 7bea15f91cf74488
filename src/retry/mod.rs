//! Bounded exponential-backoff retry for fallible async calls.
//!
//! One call to [`Retry::run`] moves through
//! `Attempting -> (Success | TransientFailure -> Waiting -> Attempting | PermanentFailure)`.
//! The wrapper never swallows a final error: exhaustion, a non-retryable
//! error, an expired deadline and cancellation all return the last error
//! the operation produced.

pub mod predicates;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use predicates::RetryClassify;

/// Upper bound of the random extra delay, as a fraction of the computed delay.
pub const JITTER_FRACTION: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first try; up to `max_retries + 1` invocations.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap on the pre-jitter delay.
    pub max_delay: Duration,
    /// Overall budget. A wait that would end past it is not started.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Pre-jitter delay after the failure of attempt `attempt` (0-indexed):
/// `min(initial_delay * 2^attempt, max_delay)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    policy.initial_delay.saturating_mul(factor).min(policy.max_delay)
}

/// Add up to `JITTER_FRACTION` of `delay`, scaled by `sample` in `[0, 1)`.
pub fn with_jitter(delay: Duration, sample: f64) -> Duration {
    delay + delay.mul_f64(JITTER_FRACTION * sample.clamp(0.0, 1.0))
}

fn jittered(delay: Duration) -> Duration {
    with_jitter(delay, rand::random::<f64>())
}

type ShouldRetry<'a, E> = Box<dyn Fn(&E) -> bool + Send + Sync + 'a>;
type OnRetry<'a, E> = Box<dyn FnMut(&E, u32) + Send + 'a>;

/// Configured retry wrapper. Build one per call; state never outlives `run`.
pub struct Retry<'a, E> {
    policy: RetryPolicy,
    operation: &'static str,
    should_retry: ShouldRetry<'a, E>,
    on_retry: Option<OnRetry<'a, E>>,
    cancel: Option<CancellationToken>,
}

impl<'a, E: fmt::Display> Retry<'a, E> {
    /// Retries every error until the policy is exhausted.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            operation: "call",
            should_retry: Box::new(|_| true),
            on_retry: None,
            cancel: None,
        }
    }

    /// Label used in logs and the retry metric.
    pub fn named(mut self, operation: &'static str) -> Self {
        self.operation = operation;
        self
    }

    pub fn should_retry(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'a) -> Self {
        self.should_retry = Box::new(predicate);
        self
    }

    /// Hook invoked with the error and the 1-based attempt number before each wait.
    pub fn on_retry(mut self, hook: impl FnMut(&E, u32) + Send + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub async fn run<T, F, Fut>(mut self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= self.policy.max_retries || !(self.should_retry)(&err) {
                return Err(err);
            }

            let delay = jittered(backoff_delay(&self.policy, attempt));
            if let Some(deadline) = self.policy.deadline
                && started.elapsed() + delay > deadline
            {
                warn!(
                    operation = self.operation,
                    attempt = attempt + 1,
                    deadline_ms = deadline.as_millis() as u64,
                    error = %err,
                    "retry deadline reached, giving up"
                );
                return Err(err);
            }

            warn!(
                operation = self.operation,
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt {} failed, retrying in {}ms",
                attempt + 1,
                delay.as_millis()
            );
            metrics::counter!(crate::observability::RETRY_ATTEMPTS_TOTAL, "operation" => self.operation)
                .increment(1);
            if let Some(hook) = self.on_retry.as_mut() {
                hook(&err, attempt + 1);
            }

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            warn!(operation = self.operation, "retry cancelled during backoff");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }
}
