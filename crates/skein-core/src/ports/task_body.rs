//! TaskBody port - 実際にページを取得・抽出する worker function
//!
//! ブラウザ操作や抽出戦略はこの trait の向こう側にある。
//! Scheduler / RetryExecutor は payload の中身を見ず、成功か失敗か（と FailureKind）だけを見る。

use async_trait::async_trait;

use crate::domain::{TaskFailure, TaskPayload};

#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn execute(&self, target: &str) -> Result<TaskPayload, TaskFailure>;
}
