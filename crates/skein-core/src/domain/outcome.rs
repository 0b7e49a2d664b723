//! Settlement: the final, classified result of running one task.
//!
//! The scheduler never looks inside the payload; it only needs to know
//! whether the task succeeded and what the attempt says about the target's
//! health.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::failure::{FailureKind, FailureSignal, TaskFailure};

/// Opaque success payload produced by a task body.
pub type TaskPayload = serde_json::Value;

/// What one settlement tells the throttle and circuit breaker.
///
/// - `Success`: the target answered.
/// - `Failure`: the target is struggling or pushing back.
/// - `Neutral`: nothing to learn about the target (404, panics, rejections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "signal", rename_all = "snake_case")]
pub enum HealthSignal {
    Success,
    Failure(FailureSignal),
    Neutral,
}

impl HealthSignal {
    /// Health reading for a failure the task body returned normally.
    ///
    /// A business failure counts as a success: the round trip worked, the
    /// content did not.
    pub fn for_failure(failure: &TaskFailure) -> Self {
        match failure.kind {
            FailureKind::Retryable => HealthSignal::Failure(failure.throttle_signal()),
            FailureKind::Business => HealthSignal::Success,
            FailureKind::NotFound
            | FailureKind::CircuitRejected
            | FailureKind::AdmissionTimeout => HealthSignal::Neutral,
        }
    }
}

/// Final result of one task execution, after retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub outcome: Result<TaskPayload, TaskFailure>,

    /// Number of body invocations (0 when never attempted).
    pub attempts: u32,

    pub health: HealthSignal,

    /// Response time of the final attempt, when the body was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
}

impl Settlement {
    pub fn success(payload: TaskPayload, attempts: u32) -> Self {
        Self {
            outcome: Ok(payload),
            attempts,
            health: HealthSignal::Success,
            latency: None,
        }
    }

    pub fn failure(failure: TaskFailure, attempts: u32) -> Self {
        let health = HealthSignal::for_failure(&failure);
        Self {
            outcome: Err(failure),
            attempts,
            health,
            latency: None,
        }
    }

    /// A failure that says nothing about the target.
    pub fn neutral_failure(failure: TaskFailure, attempts: u32) -> Self {
        Self {
            outcome: Err(failure),
            attempts,
            health: HealthSignal::Neutral,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.outcome.as_ref().err().map(|f| f.kind)
    }

    /// Summary line reported to the backlog on failure.
    pub fn error_summary(&self) -> Option<String> {
        self.outcome
            .as_ref()
            .err()
            .map(|f| format!("{f} (attempts={})", self.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_policy() {
        assert_eq!(
            HealthSignal::for_failure(&TaskFailure::from_status(503, "down")),
            HealthSignal::Failure(FailureSignal::Status(503))
        );
        assert_eq!(
            HealthSignal::for_failure(&TaskFailure::transport("reset")),
            HealthSignal::Failure(FailureSignal::Transport)
        );
        assert_eq!(
            HealthSignal::for_failure(&TaskFailure::not_found("gone")),
            HealthSignal::Neutral
        );
        assert_eq!(
            HealthSignal::for_failure(&TaskFailure::business("no price")),
            HealthSignal::Success
        );
    }

    #[test]
    fn retryable_without_signal_counts_as_transport() {
        let f = TaskFailure::new(FailureKind::Retryable, "flaky");
        assert_eq!(
            HealthSignal::for_failure(&f),
            HealthSignal::Failure(FailureSignal::Transport)
        );
    }

    #[test]
    fn error_summary_mentions_attempts() {
        let s = Settlement::failure(TaskFailure::from_status(429, "slow down"), 3);
        assert_eq!(
            s.error_summary().as_deref(),
            Some("[retryable] status 429: slow down (attempts=3)")
        );
        assert!(Settlement::success(serde_json::json!({}), 1).error_summary().is_none());
    }
}
