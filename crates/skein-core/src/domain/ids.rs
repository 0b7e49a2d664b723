//! Task identifiers.
//!
//! ULID ベースの ID を使用します。
//! - 時刻でソート可能（生成順序 ≒ 投入順序）
//! - 分散生成可能（複数ワーカー間で調整不要）

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::ports::Clock;

/// Identifier of a Task (one unit of backlog work).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Clock の現在時刻 + ランダム部分で ULID を生成
    ///
    /// ManualClock を使うと timestamp 部分が決定的になる。
    pub fn generate(clock: &dyn Clock) -> Self {
        let timestamp_ms = clock.now().timestamp_millis().max(0) as u64;
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
