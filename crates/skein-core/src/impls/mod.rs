//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBacklog**: 開発用・テスト用のバックログ（priority + 投入順）
//! - **InMemoryStateStore**: 単一 worker 構成向けの StateStore（TTL は Clock で判定）
//! - **RedisStateStore**: 複数 worker で circuit を共有する StateStore（`redis` feature）

pub mod inmem_backlog;
pub mod inmem_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use self::inmem_backlog::{BacklogCounts, BacklogRecord, InMemoryBacklog};
pub use self::inmem_store::InMemoryStateStore;
#[cfg(feature = "redis")]
pub use self::redis_store::RedisStateStore;
