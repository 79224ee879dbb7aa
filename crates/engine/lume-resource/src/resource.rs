//! Resource Model
//!
//! The bookkeeping core every cached resource embeds, the `Resource` trait
//! the cache stores, and the typed handle collaborators work with.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lume_sched::TaskId;

use crate::state::{AtomicLoadState, LoadState};

/// Loader-private continuation slot.
///
/// Owned exclusively by the in-flight loader task until commit: the produce
/// phase moves its finished payload in, and the commit phase takes it back
/// out exactly once. The payload never aliases.
pub enum Continuation {
    /// No loader attached
    Idle,
    /// Produce phase in progress
    Producing,
    /// Produce finished; payload awaits the commit phase
    Commit(Box<dyn Any + Send>),
}

/// Loader task ids recorded on a resource
#[derive(Debug, Clone, Copy, Default)]
pub struct LoaderTasks {
    /// Produce-phase slot (`AnyWorker`)
    pub ready: Option<TaskId>,
    /// Commit-phase slot (`OwnerThread`, depends on `ready`)
    pub loaded: Option<TaskId>,
}

/// State shared by every resource type: interned URI, load state, hotness
/// and the loader continuation slot.
pub struct ResourceCore {
    uri: Arc<str>,
    state: AtomicLoadState,
    /// Decaying usage score (f32 bits)
    hotness: AtomicU32,
    tasks: Mutex<LoaderTasks>,
    continuation: Mutex<Continuation>,
}

impl ResourceCore {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: Arc::from(uri),
            state: AtomicLoadState::new(LoadState::NotLoaded),
            hotness: AtomicU32::new(0f32.to_bits()),
            tasks: Mutex::new(LoaderTasks::default()),
            continuation: Mutex::new(Continuation::Idle),
        }
    }

    /// The immutable cache key.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn interned_uri(&self) -> Arc<str> {
        Arc::clone(&self.uri)
    }

    pub fn state(&self) -> LoadState {
        self.state.load()
    }

    pub fn set_state(&self, state: LoadState) {
        tracing::trace!("{}: state -> {}", self.uri, state.name());
        self.state.store(state);
    }

    /// Conditional transition; returns whether it applied.
    pub fn transition(&self, expected: LoadState, next: LoadState) -> bool {
        self.state.transition(expected, next)
    }

    // ------------------------------------------------------------------
    // Hotness
    // ------------------------------------------------------------------

    pub fn hotness(&self) -> f32 {
        f32::from_bits(self.hotness.load(Ordering::Relaxed))
    }

    /// Mark a use: bump hotness by one.
    pub fn touch(&self) {
        self.update_hotness(|h| h + 1.0);
    }

    /// Halve hotness; called periodically by the cache.
    pub fn decay(&self) {
        self.update_hotness(|h| h * 0.5);
    }

    fn update_hotness(&self, f: impl Fn(f32) -> f32) {
        let mut cur = self.hotness.load(Ordering::Relaxed);
        loop {
            let next = f(f32::from_bits(cur)).to_bits();
            match self.hotness.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    // ------------------------------------------------------------------
    // Loader tasks and continuation
    // ------------------------------------------------------------------

    pub fn tasks(&self) -> LoaderTasks {
        *self.tasks.lock().unwrap()
    }

    pub(crate) fn set_tasks(&self, ready: TaskId, loaded: TaskId) {
        *self.tasks.lock().unwrap() = LoaderTasks {
            ready: Some(ready),
            loaded: Some(loaded),
        };
    }

    /// Mark the produce phase underway (no-op if already producing).
    pub fn mark_producing(&self) {
        let mut slot = self.continuation.lock().unwrap();
        if matches!(*slot, Continuation::Idle) {
            *slot = Continuation::Producing;
        }
    }

    /// Hand the produce result to the commit phase.
    pub fn install_commit(&self, payload: Box<dyn Any + Send>) {
        *self.continuation.lock().unwrap() = Continuation::Commit(payload);
    }

    /// Take the commit payload, clearing the slot. `None` means the produce
    /// phase has not finished, so the caller is the produce phase.
    pub fn take_commit(&self) -> Option<Box<dyn Any + Send>> {
        let mut slot = self.continuation.lock().unwrap();
        if matches!(*slot, Continuation::Commit(_)) {
            match std::mem::replace(&mut *slot, Continuation::Idle) {
                Continuation::Commit(payload) => Some(payload),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ResourceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCore")
            .field("uri", &self.uri)
            .field("state", &self.state())
            .field("hotness", &self.hotness())
            .finish()
    }
}

/// A cacheable, loadable entity.
///
/// Concrete resource types embed a [`ResourceCore`] and expose their typed
/// payload; the cache only ever sees this trait.
pub trait Resource: Send + Sync + 'static {
    fn core(&self) -> &ResourceCore;

    /// Release bulk data on eviction. Metadata must survive so the entry
    /// keeps its identity; default is a no-op for metadata-only resources.
    fn release_bulk(&self) {}

    /// Bytes of bulk data currently held (for cache stats).
    fn bulk_bytes(&self) -> usize {
        0
    }

    fn as_any(&self) -> &dyn Any;

    /// Arc-preserving upcast used by typed lookup.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Typed reference to a cached resource.
///
/// Cloning a handle is the acquire side of the reference count; dropping it
/// is the release. The cache keeps its own reference, so destruction of the
/// underlying entity is deferred to eviction or `forget`.
pub struct Handle<T: Resource> {
    inner: Arc<T>,
}

impl<T: Resource> Handle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    /// The shared allocation behind this handle.
    pub fn shared(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: Resource> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resource> std::ops::Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}
