//! InMemoryBacklog - 開発用・テスト用のタスクバックログ
//!
//! # 実装詳細
//! - records: TaskId -> BacklogRecord（状態の正本）
//! - ready: (priority, sequence) の min-heap。heap には TaskId だけを置く
//! - priority は小さいほど先、同じ priority 内は投入順（FIFO）

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::domain::{Task, TaskId, TaskPayload, TaskStatus};
use crate::error::EngineError;
use crate::ports::{Backlog, Clock, SystemClock};

/// Heap entry. Ordering is reversed so `BinaryHeap` pops the smallest
/// `(priority, sequence)` first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u8,
    sequence: u64,
    task_id: TaskId,
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.sequence).cmp(&(self.priority, self.sequence))
    }
}

/// Task + what the scheduler reported about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacklogRecord {
    pub task: Task,
    pub result: Option<TaskPayload>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BacklogCounts {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl BacklogCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.failed
    }
}

struct BacklogState {
    records: HashMap<TaskId, BacklogRecord>,
    ready: BinaryHeap<ReadyEntry>,
    next_sequence: u64,
}

pub struct InMemoryBacklog {
    clock: Arc<dyn Clock>,
    state: Mutex<BacklogState>,
}

impl InMemoryBacklog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(BacklogState {
                records: HashMap::new(),
                ready: BinaryHeap::new(),
                next_sequence: 1,
            }),
        }
    }

    /// Enqueue `target`. Lower `priority` runs first.
    pub async fn add(&self, target: impl Into<String>, priority: u8) -> TaskId {
        let id = TaskId::generate(self.clock.as_ref());
        let mut state = self.state.lock().await;

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let task = Task::new(id, target, sequence, priority);
        state.ready.push(ReadyEntry {
            priority,
            sequence,
            task_id: id,
        });
        state.records.insert(
            id,
            BacklogRecord {
                task,
                result: None,
                last_error: None,
            },
        );
        id
    }

    pub async fn get(&self, id: TaskId) -> Option<BacklogRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn counts(&self) -> BacklogCounts {
        let state = self.state.lock().await;
        let mut counts = BacklogCounts::default();
        for record in state.records.values() {
            match record.task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Every task has reached `Done` or `Failed`.
    pub async fn is_settled(&self) -> bool {
        let state = self.state.lock().await;
        state.records.values().all(|r| r.task.status.is_terminal())
    }
}

impl Default for InMemoryBacklog {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl BacklogState {
    /// Processing のものだけが結果を受け取れる
    fn processing_mut(&mut self, id: TaskId) -> Result<&mut BacklogRecord, EngineError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownTask(id))?;
        if record.task.status != TaskStatus::Processing {
            return Err(EngineError::NotProcessing(id));
        }
        Ok(record)
    }
}

#[async_trait]
impl Backlog for InMemoryBacklog {
    async fn fetch_next(&self) -> Result<Option<Task>, EngineError> {
        let mut state = self.state.lock().await;

        while let Some(entry) = state.ready.pop() {
            let Some(record) = state.records.get_mut(&entry.task_id) else {
                continue;
            };
            if record.task.status != TaskStatus::Pending {
                continue;
            }
            record.task.status = TaskStatus::Processing;
            record.task.attempts += 1;
            return Ok(Some(record.task.clone()));
        }
        Ok(None)
    }

    async fn mark_done(&self, task_id: TaskId, result: TaskPayload) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let record = state.processing_mut(task_id)?;
        record.task.status = TaskStatus::Done;
        record.result = Some(result);
        record.last_error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        task_id: TaskId,
        error_summary: String,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let record = state.processing_mut(task_id)?;
        record.task.status = TaskStatus::Failed;
        record.last_error = Some(error_summary);
        Ok(())
    }
}
