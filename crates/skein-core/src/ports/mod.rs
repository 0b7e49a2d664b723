//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。
//! バックログ、タスク本体（ブラウザ側）、共有状態ストア、時計を trait として切り出し、
//! engine 本体はこれらの実装の詳細を知らない。

pub mod backlog;
pub mod clock;
pub mod state_store;
pub mod task_body;

pub use self::backlog::Backlog;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::state_store::StateStore;
pub use self::task_body::TaskBody;
