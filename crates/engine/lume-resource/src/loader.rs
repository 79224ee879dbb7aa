//! Two-Phase Loader Convention
//!
//! Every concrete loader is one task object scheduled under two slots:
//! a produce phase on any worker (decode/parse, yield-retry on slow I/O)
//! and a commit phase on the owner thread (create device-owned objects and
//! publish). The phases share the resource's continuation slot: an empty
//! slot means the produce phase is still running, a populated one means the
//! commit payload is ready.
//!
//! A produce phase that finds its input malformed sets the resource to
//! `Aborted` and still installs a payload, so the commit phase runs exactly
//! once to release loader-held resources without publishing anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use lume_sched::{SchedError, Scheduler, SharedTask, TaskId, ThreadAffinity};

use crate::resource::ResourceCore;
use crate::state::LoadState;

/// Result of one non-blocking pull from a byte source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// No bytes available yet; the caller should yield-retry
    NotReady,
    /// This many bytes were written into the buffer
    Data(usize),
    /// The source is exhausted
    Eof,
}

/// Non-blocking byte supply for loader produce phases.
///
/// Transports and container demuxers live outside this crate; they plug in
/// by implementing this trait.
pub trait ByteSource: Send {
    fn pull(&mut self, buf: &mut [u8]) -> Pull;
}

/// In-memory byte source with a scriptable not-ready phase.
///
/// Stands in for slow transports in tests and demos: the first
/// `initial_stalls` pulls report [`Pull::NotReady`], then data flows in
/// `chunk`-sized pieces.
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    stalls: u32,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            chunk: 8192,
            stalls: 0,
        }
    }

    /// Deliver at most `chunk` bytes per pull.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Report not-ready for the first `n` pulls.
    pub fn with_initial_stalls(mut self, n: u32) -> Self {
        self.stalls = n;
        self
    }
}

impl ByteSource for MemorySource {
    fn pull(&mut self, buf: &mut [u8]) -> Pull {
        if self.stalls > 0 {
            self.stalls -= 1;
            return Pull::NotReady;
        }
        if self.pos >= self.data.len() {
            return Pull::Eof;
        }
        let n = (self.data.len() - self.pos).min(self.chunk).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Pull::Data(n)
    }
}

// ============================================================================
// Device context
// ============================================================================

/// Opaque handle to a device-owned object (texture, buffer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Thread-bound device object factory.
///
/// Implementations wrap the real graphics/audio backend. Every method may
/// only be called from the scheduler's owner thread; commit phases are the
/// only loader code allowed to touch it.
pub trait DeviceContext: Send + Sync {
    fn create_image(&self, width: u32, height: u32, pixels: &[u8]) -> DeviceHandle;
    fn create_buffer(&self, bytes: &[u8]) -> DeviceHandle;
    fn destroy(&self, handle: DeviceHandle);
}

/// Device double that records creations and the thread they happened on.
#[derive(Debug, Default)]
pub struct NullDevice {
    next: AtomicU64,
    created_on: Mutex<Vec<ThreadId>>,
    live: Mutex<Vec<DeviceHandle>>,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads on which objects were created, in order.
    pub fn creation_threads(&self) -> Vec<ThreadId> {
        self.created_on.lock().unwrap().clone()
    }

    /// Objects created and not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn create(&self) -> DeviceHandle {
        let handle = DeviceHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.created_on.lock().unwrap().push(std::thread::current().id());
        self.live.lock().unwrap().push(handle);
        handle
    }
}

impl DeviceContext for NullDevice {
    fn create_image(&self, _width: u32, _height: u32, _pixels: &[u8]) -> DeviceHandle {
        self.create()
    }

    fn create_buffer(&self, _bytes: &[u8]) -> DeviceHandle {
        self.create()
    }

    fn destroy(&self, handle: DeviceHandle) {
        self.live.lock().unwrap().retain(|h| *h != handle);
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Register a loader task under the produce/commit slot pair.
///
/// The produce slot is reserved first, the commit slot attaches to it as a
/// dependent, and only then is the produce slot made runnable: even a
/// produce phase that finishes instantly cannot slip past its dependent's
/// registration. Both ids are recorded on the resource and the state moves
/// to `Loading`.
pub fn submit_loader(
    sched: &Scheduler,
    core: &ResourceCore,
    task: SharedTask,
) -> Result<(TaskId, TaskId), SchedError> {
    let ready = sched.begin_add(Arc::clone(&task), ThreadAffinity::AnyWorker)?;
    let loaded = sched.submit(task, ThreadAffinity::OwnerThread, Some(ready))?;
    core.set_tasks(ready, loaded);
    core.set_state(LoadState::Loading);
    sched.finish_add(ready)?;
    tracing::debug!("{}: loader submitted (ready {}, loaded {})", core.uri(), ready, loaded);
    Ok((ready, loaded))
}
