use serde::{Deserialize, Serialize};

use super::{PartitionKey, TaskId};

/// Lifecycle status of a backlog task.
///
/// State transitions:
/// - Pending -> Processing -> Done
/// - Pending -> Processing -> Failed
///
/// The backlog owns these transitions; the scheduler only reports outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// One unit of backlog work, borrowed by the scheduler for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// What to contact (usually a URL).
    pub target: String,

    /// Monotonically assigned by the backlog on insert.
    pub sequence: u64,

    /// Lower runs first.
    pub priority: u8,

    /// Times this task has been handed out by the backlog.
    pub attempts: u32,

    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: TaskId, target: impl Into<String>, sequence: u64, priority: u8) -> Self {
        Self {
            id,
            target: target.into(),
            sequence,
            priority,
            attempts: 0,
            status: TaskStatus::Pending,
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::from_target(&self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;

    #[test]
    fn new_task_is_pending_with_no_attempts() {
        let task = Task::new(TaskId::generate(&SystemClock), "https://shop.example/p/1", 1, 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.partition_key().as_str(), "shop.example");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
