//! Resource Errors

use lume_sched::SchedError;

/// Errors surfaced by the resource cache
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    /// No registered factory claimed the URI
    #[error("No loader for URI: {0}")]
    UnclaimedUri(String),

    /// The entry exists but is not of the requested type
    #[error("Resource type mismatch for URI: {0}")]
    WrongType(String),

    /// Scheduler failure while submitting loader tasks
    #[error("Scheduler error: {0}")]
    Sched(#[from] SchedError),
}
