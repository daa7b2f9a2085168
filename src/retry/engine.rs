//! Retry engine driving attempts through the circuit breaker

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::policy::RetryPolicy;
use crate::context::{CallContext, ContextError};
use crate::error::{ResilienceError, TransportError};
use crate::pool::{BreakerKey, CircuitBreaker};

/// Value returned by a successful [`RetryEngine::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Transport invocations made, the successful one included
    pub attempts: u32,
}

/// Retry engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Transport invocations
    pub total_attempts: u64,
    /// Invocations after the first one of a call
    pub total_retries: u64,
    /// Calls that succeeded after at least one retry
    pub successful_retries: u64,
    /// Calls that ran out of attempts on a retryable error
    pub exhausted: u64,
}

#[derive(Default)]
struct Counters {
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    exhausted: AtomicU64,
}

/// Runs calls under a retry policy, gated by the circuit breaker
pub struct RetryEngine {
    breaker: Arc<CircuitBreaker>,
    counters: Counters,
}

impl RetryEngine {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            counters: Counters::default(),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Invoke `call` until it succeeds, fails with a non-retryable error, or
    /// `policy.max_attempts` invocations have been made.
    ///
    /// Every attempt first asks the breaker for `key`; an open breaker ends the
    /// call with `CircuitOpen` without invoking `call`. Each outcome is
    /// reported to the breaker before any backoff wait. Cancellation of `ctx`
    /// aborts the call with `Cancelled` and leaves the breaker untouched.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &CallContext,
        key: &BreakerKey,
        policy: &RetryPolicy,
        mut call: F,
    ) -> Result<RetryOutcome<T>, ResilienceError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            ctx.check()?;
            let permit = self.breaker.acquire(key).await?;

            self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
            if attempt > 1 {
                self.counters.total_retries.fetch_add(1, Ordering::Relaxed);
            }

            let error = match ctx.run(call(attempt)).await {
                Ok(Ok(value)) => {
                    permit.record_success();
                    if attempt > 1 {
                        self.counters.successful_retries.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, attempts = attempt, "Call succeeded after retry");
                    }
                    return Ok(RetryOutcome { value, attempts: attempt });
                }
                Ok(Err(error)) => {
                    permit.record_failure();
                    error
                }
                Err(ContextError::DeadlineExceeded) => {
                    permit.record_failure();
                    debug!(key = %key, attempt = attempt, "Call exceeded its deadline");
                    return Err(ResilienceError::DeadlineExceeded);
                }
                Err(ContextError::Cancelled) => {
                    drop(permit);
                    debug!(key = %key, attempt = attempt, "Call cancelled");
                    return Err(ResilienceError::Cancelled);
                }
            };

            let kind = error.kind();
            if !policy.should_retry(attempt, kind) || attempt >= max_attempts {
                if kind.is_retryable() {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        key = %key,
                        attempts = attempt,
                        error = %error,
                        "Retry attempts exhausted"
                    );
                } else {
                    debug!(key = %key, kind = %kind, error = %error, "Non-retryable error");
                }
                return Err(ResilienceError::Transport {
                    source: error,
                    attempts: attempt,
                });
            }

            let delay = policy.delay_for(attempt, &error);
            debug!(
                key = %key,
                attempt = attempt,
                max_attempts = max_attempts,
                kind = %kind,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            total_retries: self.counters.total_retries.load(Ordering::Relaxed),
            successful_retries: self.counters.successful_retries.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }
}
