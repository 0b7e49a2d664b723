//! App - アプリケーション層
//!
//! ports と resilience の部品を組み合わせて Scheduler を構成します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 設定検証とワイヤリング（Fail-fast）
//! - **Scheduler**: 有界並行の実行ループ（fetch → circuit → rate/throttle → retry → report）
//! - **SchedulerHandle**: バックグラウンド実行の停止と待機
//! - **DomainStatus**: partition key ごとの読み取り専用スナップショット

pub mod builder;
pub mod scheduler;
pub mod status;

pub use self::builder::{BuildError, SchedulerBuilder, connect_state_store};
pub use self::scheduler::{RunSummary, Scheduler, SchedulerHandle, SchedulerStats};
pub use self::status::DomainStatus;
