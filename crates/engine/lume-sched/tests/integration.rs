//! Integration tests - scheduler under concurrent load
//!
//! Exercises dependency ordering, affinity and helping waits with real
//! worker threads racing each other.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use lume_sched::{
    shared, Completion, FnTask, RunOutcome, SchedConfig, Scheduler, ThreadAffinity,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env(),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// DEPENDENCY ORDERING
// ============================================================================

#[test]
fn test_dependency_chains_under_load() {
    init_tracing();
    let sched = Scheduler::new(SchedConfig {
        workers: 4,
        ..SchedConfig::default()
    });

    // 32 independent two-stage chains; the second stage must always observe
    // the first stage's side effect.
    let mut finals = Vec::new();
    let violations = Arc::new(AtomicUsize::new(0));

    for _ in 0..32 {
        let flag = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&flag);
        let first = sched
            .submit(
                shared(FnTask::new(move |_| {
                    f.store(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();

        let f = Arc::clone(&flag);
        let v = Arc::clone(&violations);
        let second = sched
            .submit(
                shared(FnTask::new(move |_| {
                    if f.load(Ordering::SeqCst) != 1 {
                        v.fetch_add(1, Ordering::SeqCst);
                    }
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                Some(first),
            )
            .unwrap();
        finals.push(second);
    }

    for id in finals {
        assert_eq!(sched.wait(id).unwrap(), Completion::Done);
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    sched.shutdown();
}

// ============================================================================
// AFFINITY
// ============================================================================

#[test]
fn test_owner_slots_only_run_on_owner() {
    init_tracing();
    let sched = Scheduler::new(SchedConfig {
        workers: 4,
        ..SchedConfig::default()
    });
    let owner = sched.owner_thread_id();
    let wrong_thread = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for _ in 0..16 {
        let w = Arc::clone(&wrong_thread);
        let id = sched
            .submit(
                shared(FnTask::new(move |_| {
                    if thread::current().id() != owner {
                        w.fetch_add(1, Ordering::SeqCst);
                    }
                    RunOutcome::Done
                })),
                ThreadAffinity::OwnerThread,
                None,
            )
            .unwrap();
        ids.push(id);
    }

    // Pump per frame until everything drained.
    while ids.iter().any(|id| !sched.is_complete(*id)) {
        sched.pump();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(wrong_thread.load(Ordering::SeqCst), 0);
    sched.shutdown();
}

// ============================================================================
// EVENTUAL COMPLETION
// ============================================================================

#[test]
fn test_bounded_retries_reach_finalization() {
    init_tracing();
    let sched = Scheduler::new(SchedConfig {
        workers: 2,
        ..SchedConfig::default()
    });

    // Each task needs a different bounded number of scheduler passes.
    let mut ids = Vec::new();
    for needed in 1..=10u32 {
        let left = Arc::new(AtomicU32::new(needed));
        let l = Arc::clone(&left);
        let id = sched
            .submit(
                shared(FnTask::new(move |_| {
                    if l.fetch_sub(1, Ordering::SeqCst) > 1 {
                        RunOutcome::Retry
                    } else {
                        RunOutcome::Done
                    }
                })),
                ThreadAffinity::AnyWorker,
                None,
            )
            .unwrap();
        ids.push(id);
    }

    for id in ids {
        assert_eq!(sched.wait(id).unwrap(), Completion::Done);
    }
    sched.shutdown();
}

// ============================================================================
// BEGIN/FINISH ATOMICITY
// ============================================================================

#[test]
fn test_fast_dependency_never_missed() {
    init_tracing();
    // Many iterations to give a racy implementation every chance to lose.
    for _ in 0..50 {
        let sched = Scheduler::new(SchedConfig {
            workers: 4,
            ..SchedConfig::default()
        });

        let dep_done = Arc::new(AtomicU32::new(0));
        let d = Arc::clone(&dep_done);
        let fast = sched
            .begin_add(
                shared(FnTask::new(move |_| {
                    d.store(1, Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
            )
            .unwrap();

        let d = Arc::clone(&dep_done);
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        let dependent = sched
            .submit(
                shared(FnTask::new(move |_| {
                    s.store(d.load(Ordering::SeqCst), Ordering::SeqCst);
                    RunOutcome::Done
                })),
                ThreadAffinity::AnyWorker,
                Some(fast),
            )
            .unwrap();

        sched.finish_add(fast).unwrap();
        sched.wait(dependent).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        sched.shutdown();
    }
}

// ============================================================================
// WAIT FROM INSIDE A TASK
// ============================================================================

#[test]
fn test_wait_inside_task_makes_progress() {
    init_tracing();
    // A single worker waits on a slot only it could run; the helping wait
    // must execute that slot instead of deadlocking.
    let sched = Scheduler::new(SchedConfig {
        workers: 1,
        ..SchedConfig::default()
    });
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    let inner_task = shared(FnTask::new(move |_| {
        o.lock().unwrap().push("inner");
        RunOutcome::Done
    }));

    let o = Arc::clone(&order);
    let outer = sched
        .submit(
            shared(FnTask::new(move |sched: &Scheduler| {
                let inner = sched
                    .submit(Arc::clone(&inner_task), ThreadAffinity::AnyWorker, None)
                    .unwrap();
                sched.wait(inner).unwrap();
                o.lock().unwrap().push("outer");
                RunOutcome::Done
            })),
            ThreadAffinity::AnyWorker,
            None,
        )
        .unwrap();

    assert_eq!(sched.wait(outer).unwrap(), Completion::Done);
    assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
    sched.shutdown();
}
