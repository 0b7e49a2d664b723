//! Failure taxonomy for task attempts.
//!
//! Task-level failures are values, not Rust errors: the retry executor and the
//! scheduler branch on [`FailureKind`], never on where a failure came from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::PartitionKey;

/// Closed classification of why a task did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Transient: no response, soft ban (403/429), server error (5xx).
    Retryable,

    /// The resource does not exist (404). Never retried, no health impact.
    NotFound,

    /// The attempt completed but produced nothing usable.
    Business,

    /// The circuit for the partition was open; the task was never attempted.
    CircuitRejected,

    /// The task could not start within the admission deadline.
    AdmissionTimeout,
}

impl FailureKind {
    /// Map an HTTP-equivalent status code to a kind.
    ///
    /// Only meaningful for codes >= 400.
    pub fn from_status(code: u16) -> Self {
        match code {
            404 => FailureKind::NotFound,
            403 | 408 | 429 => FailureKind::Retryable,
            500..=599 => FailureKind::Retryable,
            _ => FailureKind::Business,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Retryable => "retryable",
            FailureKind::NotFound => "not_found",
            FailureKind::Business => "business",
            FailureKind::CircuitRejected => "circuit_rejected",
            FailureKind::AdmissionTimeout => "admission_timeout",
        };
        f.write_str(s)
    }
}

/// What the remote side told us, as far as throttling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FailureSignal {
    /// No response at all (connect error, reset, timeout).
    Transport,

    /// An HTTP-equivalent status code.
    Status(u16),
}

impl FailureSignal {
    /// Should this failure slow us down?
    ///
    /// Transport errors, 403, 408, 429 and 5xx do; 404, other 4xx and
    /// anything below 400 do not.
    pub fn is_throttling(self) -> bool {
        match self {
            FailureSignal::Transport => true,
            FailureSignal::Status(code) => {
                matches!(code, 403 | 408 | 429) || (500..=599).contains(&code)
            }
        }
    }
}

/// A tagged task failure: kind + human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<FailureSignal>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            signal: None,
        }
    }

    /// Classify a failed response by its status code.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::from_status(code),
            message: message.into(),
            signal: Some(FailureSignal::Status(code)),
        }
    }

    /// No response from the remote side.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            signal: Some(FailureSignal::Transport),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::from_status(404, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Business, message)
    }

    pub fn circuit_rejected(key: &PartitionKey) -> Self {
        Self::new(
            FailureKind::CircuitRejected,
            format!("circuit open for {key}"),
        )
    }

    pub fn admission_timeout(deadline: Duration) -> Self {
        Self::new(
            FailureKind::AdmissionTimeout,
            format!("not admitted within {}ms", deadline.as_millis()),
        )
    }

    /// Signal to feed the throttle, defaulting retryable failures without an
    /// explicit signal to `Transport`.
    pub fn throttle_signal(&self) -> FailureSignal {
        self.signal.unwrap_or(FailureSignal::Transport)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(FailureSignal::Status(code)) => {
                write!(f, "[{}] status {}: {}", self.kind, code, self.message)
            }
            _ => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
