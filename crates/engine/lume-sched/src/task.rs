//! Task Model
//!
//! Re-enterable units of work and the handles that identify their
//! scheduling slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Scheduler;

/// Slot ID counter
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst))
}

/// Opaque handle to one scheduling slot.
///
/// A slot is one scheduled activation of a [`Task`], with its own dependency
/// and affinity. The same task object may be registered under several ids to
/// form a multi-stage pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw numeric value (for logging).
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which thread(s) may execute a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAffinity {
    /// Any pool worker may run the slot
    AnyWorker,
    /// Only the single owner thread (the one holding device context)
    OwnerThread,
    /// A specific worker, by pool index
    Worker(usize),
}

/// What a task asks the scheduler to do after a `run` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finalize the slot, unblocking dependents
    Done,
    /// Re-queue the slot and invoke `run` again later (I/O not ready)
    Retry,
    /// Leave the slot idle until someone calls [`Scheduler::resume`]
    Park,
}

/// A re-enterable unit of work.
///
/// `run` is invoked by the scheduler on a thread matching the slot's
/// affinity. It must not block on I/O; the convention is to attempt
/// non-blocking progress and return [`RunOutcome::Retry`] when input is not
/// yet available. Two slots of the same task object never run concurrently.
pub trait Task: Send {
    fn run(&mut self, sched: &Scheduler) -> RunOutcome;
}

/// A task body shared between scheduling slots.
pub type SharedTask = Arc<Mutex<dyn Task>>;

/// Wrap a task in the shared form accepted by [`Scheduler::submit`].
pub fn shared<T: Task + 'static>(task: T) -> SharedTask {
    Arc::new(Mutex::new(task))
}

/// Adapter turning a closure into a [`Task`].
pub struct FnTask<F: FnMut(&Scheduler) -> RunOutcome + Send>(F);

impl<F: FnMut(&Scheduler) -> RunOutcome + Send> FnTask<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F: FnMut(&Scheduler) -> RunOutcome + Send> Task for FnTask<F> {
    fn run(&mut self, sched: &Scheduler) -> RunOutcome {
        (self.0)(sched)
    }
}
