//! Lume Scheduler
//!
//! Asynchronous task scheduling for the Lume content runtime.
//!
//! A fixed pool of worker threads plus exactly one owner thread (the thread
//! that constructed the [`Scheduler`], typically the one holding the
//! graphics/audio device context). Units of work are [`Task`]s registered
//! under one or more [`TaskId`] slots; each slot carries a thread affinity
//! and an optional dependency on another slot.
//!
//! # Example
//! ```rust,ignore
//! use lume_sched::{Scheduler, SchedConfig, ThreadAffinity, RunOutcome, shared, FnTask};
//!
//! let sched = Scheduler::new(SchedConfig::default());
//! let id = sched.submit(
//!     shared(FnTask::new(|_| RunOutcome::Done)),
//!     ThreadAffinity::AnyWorker,
//!     None,
//! )?;
//! sched.wait(id)?;
//! sched.shutdown();
//! ```

mod config;
mod error;
mod scheduler;
mod task;

pub use config::SchedConfig;
pub use error::SchedError;
pub use scheduler::{Completion, SchedStats, Scheduler, ThreadRole};
pub use task::{shared, FnTask, RunOutcome, SharedTask, Task, TaskId, ThreadAffinity};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
