//! skein-core
//!
//! Resilient concurrent task-execution engine: decides when, how fast and
//! whether a task's target may be contacted, and how failures are retried
//! and surfaced.
//!
//! # モジュール構成
//! - **domain**: 値型（PartitionKey, Task, TaskFailure, Settlement など）
//! - **ports**: 外部コラボレーターの抽象（Backlog, TaskBody, StateStore, Clock）
//! - **resilience**: rate limiter / adaptive throttle / circuit breaker / retry
//! - **app**: Scheduler と SchedulerBuilder、ステータス
//! - **impls**: ports の実装（InMemoryBacklog, InMemoryStateStore, RedisStateStore）
//! - **config**: 設定の型・デフォルト・検証・読み込み
//! - **error**: インフラ系エラー

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod resilience;

pub use app::{Scheduler, SchedulerBuilder};
pub use config::EngineConfig;
pub use error::EngineError;
