//! Retry policy and executor: runs a task body, retries retryable failures
//! under exponential backoff, and classifies the final result.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{RetryConfig, secs};
use crate::domain::{Settlement, Task, TaskFailure, TaskPayload};
use crate::ports::TaskBody;

/// Retry policy for failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total body invocations allowed, including the first.
    pub max_attempts: u32,

    /// Delay after the first failure; doubles per attempt.
    pub base_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,

    /// Per-attempt limit. Expiry is a retryable transport failure.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: secs(cfg.base_wait_secs),
            min_delay: secs(cfg.min_wait_secs),
            max_delay: secs(cfg.max_wait_secs),
            attempt_timeout: cfg.attempt_timeout_secs.map(secs),
        }
    }

    /// Backoff after the `attempt`-th failure (1-indexed):
    /// `base * 2^(attempt-1)`, clamped to `[min_delay, max_delay]`.
    ///
    /// With the defaults (2s, min 2s, max 10s): 2s, 4s, 8s, 10s, 10s, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exp as i32);
        secs(raw).max(self.min_delay).min(self.max_delay)
    }
}

enum Attempt {
    Done(TaskPayload, Duration),
    Failed(TaskFailure, Duration),
    Panicked(String),
}

/// Runs one task to settlement.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `body` for `task` until it succeeds, fails terminally, or runs
    /// out of attempts.
    ///
    /// Only `Retryable` failures are retried. A panic inside the body is
    /// caught here and settles as a business failure that says nothing
    /// about the target's health.
    pub async fn run(&self, body: &dyn TaskBody, task: &Task) -> Settlement {
        let mut attempt = 1;
        loop {
            match self.attempt(body, &task.target).await {
                Attempt::Done(payload, latency) => {
                    debug!(
                        task_id = %task.id,
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        "attempt succeeded"
                    );
                    return Settlement::success(payload, attempt).with_latency(latency);
                }
                Attempt::Panicked(msg) => {
                    warn!(task_id = %task.id, attempt, panic = %msg, "task body panicked");
                    return Settlement::neutral_failure(
                        TaskFailure::business(format!("task body panicked: {msg}")),
                        attempt,
                    );
                }
                Attempt::Failed(failure, _)
                    if failure.kind.is_retryable() && attempt < self.policy.max_attempts =>
                {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        task_id = %task.id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Failed(failure, latency) => {
                    debug!(task_id = %task.id, attempt, error = %failure, "attempt failed terminally");
                    return Settlement::failure(failure, attempt).with_latency(latency);
                }
            }
        }
    }

    async fn attempt(&self, body: &dyn TaskBody, target: &str) -> Attempt {
        let started = Instant::now();
        let call = AssertUnwindSafe(body.execute(target)).catch_unwind();

        let caught = match self.policy.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(caught) => caught,
                Err(_) => {
                    return Attempt::Failed(
                        TaskFailure::transport(format!(
                            "attempt timed out after {}ms",
                            limit.as_millis()
                        )),
                        started.elapsed(),
                    );
                }
            },
            None => call.await,
        };

        match caught {
            Ok(Ok(payload)) => Attempt::Done(payload, started.elapsed()),
            Ok(Err(failure)) => Attempt::Failed(failure, started.elapsed()),
            Err(panic) => Attempt::Panicked(panic_message(panic.as_ref())),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
