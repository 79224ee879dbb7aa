//! Scheduler Errors

use crate::TaskId;

/// Errors surfaced by scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The id does not name a registered slot
    #[error("Unknown task slot: {0}")]
    UnknownTask(TaskId),

    /// The scheduler has been shut down
    #[error("Scheduler is shut down")]
    ShutDown,
}
