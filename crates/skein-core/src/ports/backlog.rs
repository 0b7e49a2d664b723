//! Backlog port - 永続タスクバックログ（外部コラボレーター）
//!
//! Scheduler は容量に空きがある時だけ `fetch_next` を呼び、
//! 1 回の実行につき `mark_done` / `mark_failed` のどちらかを必ず 1 回だけ呼ぶ。

use async_trait::async_trait;

use crate::domain::{Task, TaskId, TaskPayload};
use crate::error::EngineError;

/// Backlog はタスクの所有者（状態遷移の権威）
///
/// # 設計原則
/// - `fetch_next` は task を processing にして貸し出す
/// - 結果の記録（done / failed）は backlog 側の責務
/// - 空なら `Ok(None)`（待つのは Scheduler 側）
#[async_trait]
pub trait Backlog: Send + Sync {
    async fn fetch_next(&self) -> Result<Option<Task>, EngineError>;

    async fn mark_done(&self, task_id: TaskId, result: TaskPayload) -> Result<(), EngineError>;

    async fn mark_failed(&self, task_id: TaskId, error_summary: String)
    -> Result<(), EngineError>;
}
