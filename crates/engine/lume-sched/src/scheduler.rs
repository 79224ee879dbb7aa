//! Task Scheduler
//!
//! Worker pool plus a single owner thread, with per-affinity ready queues,
//! dependency edges between slots, helping waits and yield-retry.
//!
//! The thread that calls [`Scheduler::new`] becomes the owner thread: the
//! only thread allowed to run `OwnerThread`-affine slots. It must call
//! [`Scheduler::pump`] once per frame to drain owner-affine work.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::error::SchedError;
use crate::task::{next_task_id, RunOutcome, SharedTask, TaskId, ThreadAffinity};
use crate::SchedConfig;

/// How a finalized slot ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The task returned normally
    Done,
    /// The slot was aborted without (further) execution
    Aborted,
}

/// Identity of the calling thread relative to a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// The designated owner thread
    Owner,
    /// A pool worker, by index
    Worker(usize),
    /// Any other thread
    External,
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedStats {
    pub submitted: u64,
    pub completed: u64,
    pub retried: u64,
    pub aborted: u64,
    /// Slots registered but not yet finalized
    pub pending: usize,
}

/// Lifecycle of one scheduling slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Reserved via `begin_add`, not yet eligible
    Held,
    /// Waiting on its dependency
    Pending,
    /// In a ready queue
    Queued,
    /// `run` in progress
    Running,
    /// Idle until `resume`
    Parked,
    /// Finalized normally
    Done,
    /// Finalized by cancellation or shutdown
    Aborted,
}

impl SlotState {
    fn is_final(&self) -> bool {
        matches!(self, SlotState::Done | SlotState::Aborted)
    }
}

struct Slot {
    task: SharedTask,
    affinity: ThreadAffinity,
    /// Slots blocked on this one
    dependents: Vec<TaskId>,
    state: SlotState,
    cancelled: bool,
}

#[derive(Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    retried: u64,
    aborted: u64,
}

struct Inner {
    slots: HashMap<TaskId, Slot>,
    any_queue: VecDeque<TaskId>,
    owner_queue: VecDeque<TaskId>,
    worker_queues: Vec<VecDeque<TaskId>>,
    /// OS thread ids of pool workers, filled in as they start
    worker_ids: Vec<Option<ThreadId>>,
    stats: Counters,
    shutdown: bool,
}

impl Inner {
    fn push_ready(&mut self, id: TaskId, affinity: ThreadAffinity) {
        match affinity {
            ThreadAffinity::AnyWorker => self.any_queue.push_back(id),
            ThreadAffinity::OwnerThread => self.owner_queue.push_back(id),
            ThreadAffinity::Worker(i) => self.worker_queues[i].push_back(id),
        }
    }

    /// Pop the next runnable id from a queue, skipping entries finalized
    /// while they sat in the queue. Marks the winner `Running`.
    fn pop_queue(slots: &mut HashMap<TaskId, Slot>, queue: &mut VecDeque<TaskId>) -> Option<TaskId> {
        while let Some(id) = queue.pop_front() {
            if let Some(slot) = slots.get_mut(&id) {
                if slot.state == SlotState::Queued {
                    slot.state = SlotState::Running;
                    return Some(id);
                }
            }
        }
        None
    }

    /// Pop a slot the given role may legally execute.
    fn pop_for(&mut self, role: ThreadRole) -> Option<TaskId> {
        match role {
            ThreadRole::Owner => Self::pop_queue(&mut self.slots, &mut self.owner_queue)
                .or_else(|| Self::pop_queue(&mut self.slots, &mut self.any_queue)),
            ThreadRole::Worker(i) => Self::pop_queue(&mut self.slots, &mut self.worker_queues[i])
                .or_else(|| Self::pop_queue(&mut self.slots, &mut self.any_queue)),
            ThreadRole::External => Self::pop_queue(&mut self.slots, &mut self.any_queue),
        }
    }

    /// Owner-affine work only (the per-frame pump).
    fn pop_owner_only(&mut self) -> Option<TaskId> {
        Self::pop_queue(&mut self.slots, &mut self.owner_queue)
    }
}

/// Slot table and wakeup shared between the scheduler handle and its
/// workers. Workers own this directly so an idle pool never keeps the
/// `Scheduler` itself alive.
struct Core {
    inner: Mutex<Inner>,
    /// Notified on every enqueue and finalization
    work_cv: Condvar,
}

/// Task scheduler with thread affinity and dependency tracking
pub struct Scheduler {
    core: Arc<Core>,
    owner: ThreadId,
    worker_count: usize,
    pump_batch: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler and spawn its worker pool.
    ///
    /// The calling thread is recorded as the owner thread.
    pub fn new(config: SchedConfig) -> Arc<Self> {
        let worker_count = config.workers;

        let sched = Arc::new(Self {
            core: Arc::new(Core {
                inner: Mutex::new(Inner {
                    slots: HashMap::new(),
                    any_queue: VecDeque::new(),
                    owner_queue: VecDeque::new(),
                    worker_queues: vec![VecDeque::new(); worker_count],
                    worker_ids: vec![None; worker_count],
                    stats: Counters::default(),
                    shutdown: false,
                }),
                work_cv: Condvar::new(),
            }),
            owner: thread::current().id(),
            worker_count,
            pump_batch: config.pump_batch,
            workers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            // Workers park on the shared core and hold the scheduler only
            // weakly, so dropping the last user handle triggers
            // Drop -> shutdown instead of leaking the pool.
            let core = Arc::clone(&sched.core);
            let weak = Arc::downgrade(&sched);
            let handle = thread::Builder::new()
                .name(format!("lume-worker-{}", index))
                .spawn(move || Self::worker_loop(core, weak, index))
                .expect("Failed to spawn worker thread");
            handles.push(handle);
        }
        *sched.workers.lock().unwrap() = handles;

        tracing::info!("Scheduler started with {} workers", worker_count);
        sched
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a new slot for `task`. With a dependency, the slot is not
    /// eligible until the dependency is finalized.
    pub fn submit(
        &self,
        task: SharedTask,
        affinity: ThreadAffinity,
        dep: Option<TaskId>,
    ) -> Result<TaskId, SchedError> {
        self.register(task, affinity, dep, false)
    }

    /// Reserve a slot without making it runnable.
    ///
    /// Dependents may be attached to the returned id before the slot can
    /// possibly complete; call [`Scheduler::finish_add`] to make it eligible.
    /// This closes the race where a fast-finishing dependency is missed by a
    /// dependent registered moments later.
    pub fn begin_add(&self, task: SharedTask, affinity: ThreadAffinity) -> Result<TaskId, SchedError> {
        self.register(task, affinity, None, true)
    }

    /// Make a slot reserved with [`Scheduler::begin_add`] eligible to run.
    pub fn finish_add(&self, id: TaskId) -> Result<(), SchedError> {
        let mut inner = self.core.inner.lock().unwrap();
        let slot = inner.slots.get_mut(&id).ok_or(SchedError::UnknownTask(id))?;
        if slot.state == SlotState::Held {
            slot.state = SlotState::Queued;
            let affinity = slot.affinity;
            inner.push_ready(id, affinity);
            self.core.work_cv.notify_all();
        }
        Ok(())
    }

    fn register(
        &self,
        task: SharedTask,
        affinity: ThreadAffinity,
        dep: Option<TaskId>,
        held: bool,
    ) -> Result<TaskId, SchedError> {
        if let ThreadAffinity::Worker(i) = affinity {
            assert!(i < self.worker_count, "worker affinity {} out of range", i);
        }

        let mut inner = self.core.inner.lock().unwrap();
        if inner.shutdown {
            return Err(SchedError::ShutDown);
        }

        let id = next_task_id();
        let mut state = if held { SlotState::Held } else { SlotState::Queued };

        if let Some(dep_id) = dep {
            let dep_slot = inner
                .slots
                .get_mut(&dep_id)
                .ok_or(SchedError::UnknownTask(dep_id))?;
            if !dep_slot.state.is_final() {
                dep_slot.dependents.push(id);
                if !held {
                    state = SlotState::Pending;
                }
            }
        }

        inner.slots.insert(
            id,
            Slot {
                task,
                affinity,
                dependents: Vec::new(),
                state,
                cancelled: false,
            },
        );
        inner.stats.submitted += 1;

        if state == SlotState::Queued {
            inner.push_ready(id, affinity);
            self.core.work_cv.notify_all();
        }

        tracing::debug!("Registered slot {} ({:?}, dep: {:?})", id, affinity, dep);
        Ok(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Whether the slot has been finalized (normally or by abort).
    pub fn is_complete(&self, id: TaskId) -> bool {
        self.completion(id).is_some()
    }

    /// Final state of a slot, if it has one yet.
    pub fn completion(&self, id: TaskId) -> Option<Completion> {
        let inner = self.core.inner.lock().unwrap();
        match inner.slots.get(&id).map(|s| s.state) {
            Some(SlotState::Done) => Some(Completion::Done),
            Some(SlotState::Aborted) => Some(Completion::Aborted),
            _ => None,
        }
    }

    /// Identity of the calling thread relative to this scheduler.
    pub fn current_role(&self) -> ThreadRole {
        let tid = thread::current().id();
        if tid == self.owner {
            return ThreadRole::Owner;
        }
        let inner = self.core.inner.lock().unwrap();
        match inner.worker_ids.iter().position(|w| *w == Some(tid)) {
            Some(i) => ThreadRole::Worker(i),
            None => ThreadRole::External,
        }
    }

    /// OS id of the calling thread.
    pub fn current_thread_id(&self) -> ThreadId {
        thread::current().id()
    }

    /// OS id of the owner thread.
    pub fn owner_thread_id(&self) -> ThreadId {
        self.owner
    }

    /// Whether the calling thread is the owner thread.
    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Number of pool workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Snapshot of the scheduler counters.
    pub fn stats(&self) -> SchedStats {
        let inner = self.core.inner.lock().unwrap();
        SchedStats {
            submitted: inner.stats.submitted,
            completed: inner.stats.completed,
            retried: inner.stats.retried,
            aborted: inner.stats.aborted,
            pending: inner.slots.values().filter(|s| !s.state.is_final()).count(),
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Drain owner-affine ready work, bounded to one batch.
    ///
    /// Must be called from the owner thread, once per external frame/tick.
    /// Returns the number of slots run.
    pub fn pump(&self) -> usize {
        debug_assert!(self.is_owner_thread(), "pump called off the owner thread");
        let mut ran = 0;
        while ran < self.pump_batch {
            let id = self.core.inner.lock().unwrap().pop_owner_only();
            match id {
                Some(id) => {
                    self.run_slot(id);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Block until the slot is finalized.
    ///
    /// While blocked, the calling thread keeps executing other ready slots it
    /// is eligible for, so a thread waiting on work only it could indirectly
    /// unblock never deadlocks.
    pub fn wait(&self, id: TaskId) -> Result<Completion, SchedError> {
        {
            let inner = self.core.inner.lock().unwrap();
            if !inner.slots.contains_key(&id) {
                return Err(SchedError::UnknownTask(id));
            }
        }
        let role = self.current_role();

        loop {
            let mut inner = self.core.inner.lock().unwrap();
            match inner.slots.get(&id).map(|s| s.state) {
                Some(SlotState::Done) => return Ok(Completion::Done),
                Some(SlotState::Aborted) | None => return Ok(Completion::Aborted),
                _ => {}
            }

            // Helping wait: run something else rather than idling.
            if let Some(next) = inner.pop_for(role) {
                drop(inner);
                self.run_slot(next);
                continue;
            }

            // Timeout so shutdown and late enqueues are always noticed.
            let (guard, _) = self
                .core
                .work_cv
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            drop(guard);
        }
    }

    /// Re-queue a parked slot.
    ///
    /// Idempotent: a slot that is queued, running or finalized is left alone.
    pub fn resume(&self, id: TaskId) -> Result<(), SchedError> {
        let mut inner = self.core.inner.lock().unwrap();
        let slot = inner.slots.get_mut(&id).ok_or(SchedError::UnknownTask(id))?;
        if slot.state == SlotState::Parked {
            slot.state = SlotState::Queued;
            let affinity = slot.affinity;
            inner.push_ready(id, affinity);
            self.core.work_cv.notify_all();
            tracing::trace!("Resumed slot {}", id);
        }
        Ok(())
    }

    /// Abort one slot without running it (again).
    ///
    /// Dependents of the aborted slot become eligible and DO run; a paired
    /// commit-phase slot thereby executes once to release loader-held
    /// resources. Contrast with [`Scheduler::shutdown`], which aborts
    /// dependents recursively without running anything.
    pub fn cancel_chain(&self, id: TaskId) -> Result<(), SchedError> {
        let mut inner = self.core.inner.lock().unwrap();
        let slot = inner.slots.get_mut(&id).ok_or(SchedError::UnknownTask(id))?;
        match slot.state {
            SlotState::Done | SlotState::Aborted => {}
            SlotState::Running => {
                // Cannot interrupt mid-run; the post-run transition aborts it.
                slot.cancelled = true;
            }
            _ => {
                slot.cancelled = true;
                self.finalize_locked(&mut inner, id, Completion::Aborted);
            }
        }
        tracing::debug!("Cancelled slot {}", id);
        Ok(())
    }

    /// Abort every non-finalized slot and join the worker pool.
    ///
    /// Nothing runs after this: dependents of aborted slots are aborted too.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.core.inner.lock().unwrap();
            inner.shutdown = true;
            let mut aborted = 0;
            for slot in inner.slots.values_mut() {
                if !slot.state.is_final() {
                    slot.state = SlotState::Aborted;
                    aborted += 1;
                }
            }
            inner.stats.aborted += aborted;
            inner.any_queue.clear();
            inner.owner_queue.clear();
            for q in &mut inner.worker_queues {
                q.clear();
            }
        }
        self.core.work_cv.notify_all();

        // Drop can fire on a worker thread (last strong handle released
        // there); a thread cannot join itself.
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        tracing::info!("Scheduler shut down");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn worker_loop(core: Arc<Core>, weak: Weak<Self>, index: usize) {
        core.inner.lock().unwrap().worker_ids[index] = Some(thread::current().id());

        loop {
            let id = {
                let mut inner = core.inner.lock().unwrap();
                loop {
                    if inner.shutdown {
                        return;
                    }
                    if let Some(id) = inner.pop_for(ThreadRole::Worker(index)) {
                        break id;
                    }
                    // Wait with timeout to re-check shutdown.
                    let (guard, _) = core
                        .work_cv
                        .wait_timeout(inner, Duration::from_millis(100))
                        .unwrap();
                    inner = guard;
                }
            };
            // A strong handle exists only while running a slot; an idle
            // pool never keeps the scheduler alive.
            let Some(sched) = weak.upgrade() else { return };
            sched.run_slot(id);
        }
    }

    /// Run one slot whose state was just set to `Running`.
    fn run_slot(&self, id: TaskId) {
        let task = {
            let inner = self.core.inner.lock().unwrap();
            match inner.slots.get(&id) {
                Some(slot) => Arc::clone(&slot.task),
                None => return,
            }
        };

        // The task lock is what keeps two slots of one task object from
        // running concurrently. Contention means the sibling slot is mid-run;
        // put this one back instead of blocking a scheduler thread on it.
        let outcome = match task.try_lock() {
            Ok(mut body) => body.run(self),
            Err(_) => {
                self.requeue(id);
                return;
            }
        };

        let mut inner = self.core.inner.lock().unwrap();
        let (cancelled, affinity, state) = match inner.slots.get(&id) {
            Some(slot) => (slot.cancelled, slot.affinity, slot.state),
            None => return,
        };
        // Shutdown may have finalized the slot mid-run; its outcome no
        // longer counts and its dependents must stay aborted.
        if state.is_final() {
            return;
        }

        match outcome {
            RunOutcome::Done => {
                self.finalize_locked(&mut inner, id, Completion::Done);
                tracing::trace!("Slot {} finalized", id);
            }
            RunOutcome::Retry => {
                inner.stats.retried += 1;
                if cancelled || inner.shutdown {
                    self.finalize_locked(&mut inner, id, Completion::Aborted);
                } else {
                    if let Some(slot) = inner.slots.get_mut(&id) {
                        slot.state = SlotState::Queued;
                    }
                    inner.push_ready(id, affinity);
                    self.core.work_cv.notify_all();
                    tracing::trace!("Slot {} yielded, re-queued", id);
                }
            }
            RunOutcome::Park => {
                if cancelled || inner.shutdown {
                    self.finalize_locked(&mut inner, id, Completion::Aborted);
                } else {
                    if let Some(slot) = inner.slots.get_mut(&id) {
                        slot.state = SlotState::Parked;
                    }
                    tracing::trace!("Slot {} parked", id);
                }
            }
        }
    }

    fn requeue(&self, id: TaskId) {
        let mut inner = self.core.inner.lock().unwrap();
        let affinity = match inner.slots.get_mut(&id) {
            Some(slot) if slot.state == SlotState::Running => {
                slot.state = SlotState::Queued;
                slot.affinity
            }
            _ => return,
        };
        inner.push_ready(id, affinity);
        self.core.work_cv.notify_all();
    }

    /// Finalize a slot and release its dependents. Caller holds the lock.
    fn finalize_locked(&self, inner: &mut Inner, id: TaskId, completion: Completion) {
        let dependents = match inner.slots.get_mut(&id) {
            Some(slot) => {
                debug_assert!(!slot.state.is_final(), "slot {} finalized twice", id);
                slot.state = match completion {
                    Completion::Done => SlotState::Done,
                    Completion::Aborted => SlotState::Aborted,
                };
                std::mem::take(&mut slot.dependents)
            }
            None => return,
        };
        match completion {
            Completion::Done => inner.stats.completed += 1,
            Completion::Aborted => inner.stats.aborted += 1,
        }

        for dep_id in dependents {
            let affinity = match inner.slots.get_mut(&dep_id) {
                Some(dep) if dep.state == SlotState::Pending => {
                    dep.state = SlotState::Queued;
                    Some(dep.affinity)
                }
                _ => None,
            };
            if let Some(affinity) = affinity {
                inner.push_ready(dep_id, affinity);
            }
        }
        self.core.work_cv.notify_all();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{shared, FnTask};
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    fn sched(workers: usize) -> Arc<Scheduler> {
        Scheduler::new(SchedConfig {
            workers,
            ..SchedConfig::default()
        })
    }

    #[test]
    fn test_submit_and_wait() {
        let s = sched(2);
        let hits = Arc::new(AtomicU32::new(0));

        let hits_c = Arc::clone(&hits);
        let id = s
            .submit(
                shared(FnTask::new(move |_| {
                    hits_c.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        assert_eq!(s.wait(id).unwrap(), Completion::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(s.is_complete(id));
        s.shutdown();
    }

    #[test]
    fn test_dependency_order() {
        let s = sched(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let a = s
            .submit(
                shared(FnTask::new(move |_| {
                    // Give the dependent every chance to run first if the
                    // dependency edge were broken.
                    thread::sleep(Duration::from_millis(20));
                    o.lock().unwrap().push('a');
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        let o = Arc::clone(&order);
        let b = s
            .submit(
                shared(FnTask::new(move |_| {
                    o.lock().unwrap().push('b');
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                Some(a),
            )
            .unwrap();

        s.wait(b).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b']);
        s.shutdown();
    }

    #[test]
    fn test_retry_until_ready() {
        let s = sched(1);
        let attempts = Arc::new(AtomicU32::new(0));

        let a = Arc::clone(&attempts);
        let id = s
            .submit(
                shared(FnTask::new(move |_| {
                    if a.fetch_add(1, Ordering::SeqCst) < 3 {
                        RunOutcome::Retry
                    } else {
                        RunOutcome::Done
                    }
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        assert_eq!(s.wait(id).unwrap(), Completion::Done);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(s.stats().retried >= 3);
        s.shutdown();
    }

    #[test]
    fn test_begin_finish_add_closes_registration_race() {
        let s = sched(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        // The dependency finishes instantly once eligible; the dependent is
        // attached while the slot is still held, so its completion cannot be
        // missed.
        let o = Arc::clone(&order);
        let fast = s
            .begin_add(
                shared(FnTask::new(move |_| {
                    o.lock().unwrap().push("dep");
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
            )
            .unwrap();

        let o = Arc::clone(&order);
        let dependent = s
            .submit(
                shared(FnTask::new(move |_| {
                    o.lock().unwrap().push("dependent");
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                Some(fast),
            )
            .unwrap();

        s.finish_add(fast).unwrap();
        s.wait(dependent).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["dep", "dependent"]);
        s.shutdown();
    }

    #[test]
    fn test_owner_affinity() {
        let s = sched(2);
        let ran_on = Arc::new(Mutex::new(None));

        let r = Arc::clone(&ran_on);
        let id = s
            .submit(
                shared(FnTask::new(move |_| {
                    *r.lock().unwrap() = Some(thread::current().id());
                    RunOutcome::Done
                })),
                ThreadAffinity::OwnerThread,
                None,
            )
            .unwrap();

        // Workers must not pick it up.
        thread::sleep(Duration::from_millis(50));
        assert!(!s.is_complete(id));

        while s.pump() == 0 {
            thread::yield_now();
        }
        assert_eq!(*ran_on.lock().unwrap(), Some(s.owner_thread_id()));
        s.shutdown();
    }

    #[test]
    fn test_specific_worker_affinity() {
        let s = sched(3);
        let ran_role = Arc::new(Mutex::new(None));

        let r = Arc::clone(&ran_role);
        let id = s
            .submit(
                shared(FnTask::new(move |sched| {
                    *r.lock().unwrap() = Some(sched.current_role());
                    RunOutcome::Done
                })),
                ThreadAffinity::Worker(2),
                None,
            )
            .unwrap();

        s.wait(id).unwrap();
        assert_eq!(*ran_role.lock().unwrap(), Some(ThreadRole::Worker(2)));
        s.shutdown();
    }

    #[test]
    fn test_park_and_resume() {
        let s = sched(1);
        let passes = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&passes);
        let id = s
            .submit(
                shared(FnTask::new(move |_| {
                    if p.fetch_add(1, Ordering::SeqCst) == 0 {
                        RunOutcome::Park
                    } else {
                        RunOutcome::Done
                    }
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        assert!(!s.is_complete(id));

        // Resume is idempotent; a second call must be harmless.
        s.resume(id).unwrap();
        s.resume(id).unwrap();
        assert_eq!(s.wait(id).unwrap(), Completion::Done);
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        s.shutdown();
    }

    #[test]
    fn test_cancel_chain_still_runs_dependent() {
        let s = sched(0);
        let produce_ran = Arc::new(AtomicU32::new(0));
        let commit_ran = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&produce_ran);
        let produce = s
            .begin_add(
                shared(FnTask::new(move |_| {
                    p.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
            )
            .unwrap();

        let c = Arc::clone(&commit_ran);
        let commit = s
            .submit(
                shared(FnTask::new(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::OwnerThread,
                Some(produce),
            )
            .unwrap();

        // Cancel before the held slot was ever eligible.
        s.cancel_chain(produce).unwrap();
        assert_eq!(s.completion(produce), Some(Completion::Aborted));

        while s.pump() == 0 {
            thread::yield_now();
        }
        assert_eq!(s.completion(commit), Some(Completion::Done));
        assert_eq!(produce_ran.load(Ordering::SeqCst), 0);
        assert_eq!(commit_ran.load(Ordering::SeqCst), 1);
        s.shutdown();
    }

    #[test]
    fn test_shutdown_aborts_everything() {
        let s = sched(0);
        let ran = Arc::new(AtomicU32::new(0));

        let r = Arc::clone(&ran);
        let a = s
            .submit(
                shared(FnTask::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();
        let r = Arc::clone(&ran);
        let b = s
            .submit(
                shared(FnTask::new(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::OwnerThread,
                Some(a),
            )
            .unwrap();

        s.shutdown();
        assert_eq!(s.completion(a), Some(Completion::Aborted));
        assert_eq!(s.completion(b), Some(Completion::Aborted));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(s.submit(shared(FnTask::new(|_| RunOutcome::Done)), ThreadAffinity::AnyWorker, None).is_err());
        assert_eq!(s.stats().aborted, 2);
    }

    #[test]
    fn test_shutdown_while_slot_runs_keeps_it_aborted() {
        let s = sched(1);
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let b = Arc::clone(&barrier);
        let id = s
            .submit(
                shared(FnTask::new(move |_| {
                    b.wait();
                    // Stay mid-run while the main thread shuts down.
                    thread::sleep(Duration::from_millis(50));
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        barrier.wait();
        s.shutdown();

        // The slot was aborted while running; its Done outcome must not
        // overwrite that, and later queries must still work.
        assert_eq!(s.completion(id), Some(Completion::Aborted));
        assert_eq!(s.stats().pending, 0);
    }

    #[test]
    fn test_drop_without_shutdown_releases_pool() {
        let s = sched(2);
        let weak = Arc::downgrade(&s);
        drop(s);

        // Workers only hold weak handles between passes, so the scheduler
        // must become unreachable shortly after the last user drop.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while weak.upgrade().is_some() {
            assert!(std::time::Instant::now() < deadline, "worker pool leaked the scheduler");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_helping_wait_with_no_workers() {
        // With zero workers, wait() itself must drive the work.
        let s = sched(0);
        let hits = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hits);
        let id = s
            .submit(
                shared(FnTask::new(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        assert_eq!(s.wait(id).unwrap(), Completion::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        s.shutdown();
    }

    #[test]
    fn test_sibling_slots_never_overlap() {
        // One task object under many slots; the body checks it is never
        // entered re-entrantly.
        struct Overlap {
            entered: Arc<AtomicUsize>,
            overlaps: Arc<AtomicUsize>,
        }
        impl crate::Task for Overlap {
            fn run(&mut self, _: &Scheduler) -> RunOutcome {
                if self.entered.fetch_add(1, Ordering::SeqCst) > 0 {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(2));
                self.entered.fetch_sub(1, Ordering::SeqCst);
                RunOutcome::Done
            }
        }

        let s = sched(4);
        let entered = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let task: SharedTask = shared(Overlap {
            entered: Arc::clone(&entered),
            overlaps: Arc::clone(&overlaps),
        });

        let ids: Vec<_> = (0..8)
            .map(|_| {
                s.submit(Arc::clone(&task), ThreadAffinity::AnyWorker, None)
                    .unwrap()
            })
            .collect();
        for id in ids {
            s.wait(id).unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        s.shutdown();
    }

    #[test]
    fn test_stats() {
        let s = sched(1);
        let id = s
            .submit(
                shared(FnTask::new(|_| RunOutcome::Done)),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();
        s.wait(id).unwrap();

        let stats = s.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        s.shutdown();
    }
}
