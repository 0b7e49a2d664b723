//! Domain model (ids, partition keys, tasks, failure taxonomy, settlements).
//!
//! 副作用を持たない値型のみ。ports / resilience / app はここに依存する。

pub mod failure;
pub mod ids;
pub mod outcome;
pub mod partition;
pub mod task;

pub use failure::{FailureKind, FailureSignal, TaskFailure};
pub use ids::TaskId;
pub use outcome::{HealthSignal, Settlement, TaskPayload};
pub use partition::{PartitionKey, UNKNOWN_PARTITION};
pub use task::{Task, TaskStatus};
