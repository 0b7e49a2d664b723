//! StateStore port - 共有 key-value ストア（Redis または InMemory）
//!
//! Circuit breaker の状態は水平スケールした worker 間で共有する必要があるため、
//! プロセス内 map ではなくこの port を経由して読み書きする。
//!
//! # セマンティクス（Redis 準拠）
//! - `set` は既存の TTL を消す
//! - `incr` は TTL を保持する。存在しない key は 0 から数える
//! - `expire` は key が存在しなければ `false`

use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), EngineError>;

    async fn incr(&self, key: &str) -> Result<i64, EngineError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, EngineError>;

    async fn delete(&self, key: &str) -> Result<(), EngineError>;
}
