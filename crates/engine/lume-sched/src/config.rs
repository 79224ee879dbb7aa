//! Scheduler Configuration

/// Scheduler configuration options
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of pool worker threads (0 is allowed: all work is then driven
    /// by `pump` and helping waits)
    pub workers: usize,

    /// Maximum owner-affine slots run per `pump` call, so a frame is never
    /// starved by a flood of commit work
    pub pump_batch: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get().saturating_sub(1).max(1))
            .unwrap_or(4);
        Self {
            workers,
            pump_batch: 64,
        }
    }
}
