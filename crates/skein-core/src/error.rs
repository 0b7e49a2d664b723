use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::TaskId;

/// Infrastructure errors from ports and wiring.
///
/// Task failures (404, soft bans, timeouts, ...) are not represented here;
/// they travel as [`crate::domain::TaskFailure`] values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state store error: {0}")]
    Store(String),

    #[error("backlog error: {0}")]
    Backlog(String),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is not processing")]
    NotProcessing(TaskId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
