//! Streaming Sub-Resource Cache
//!
//! Continuously delivered resources (audio, video) arrive in byte ranges
//! rather than all at once. [`StreamBuffer`] holds a small fixed-size set of
//! range-tagged sub-buffers: the decoding worker reserves, writes and
//! commits ranges while the playback side reads them, so every mutating
//! operation is serialized by one mutex.
//!
//! A read miss is a normal streaming condition; the playback side nudges
//! the paused loader with [`Scheduler::resume`] via [`StreamResource::read`].

use std::any::Any;
use std::sync::{Arc, Mutex};

use lume_sched::{shared, RunOutcome, Scheduler, Task};

use crate::cache::ResourceCache;
use crate::loader::{submit_loader, ByteSource, Pull};
use crate::resource::{Resource, ResourceCore};
use crate::state::LoadState;

/// Bytes pulled from the source per produce step
const CHUNK: usize = 4096;

const HOTNESS_FLOOR: f32 = 0.5;

struct Span {
    begin: u64,
    end: u64,
    data: Vec<u8>,
    /// Committed and readable
    ready: bool,
    hotness: f32,
}

struct Spans {
    spans: Vec<Span>,
}

impl Spans {
    fn find(&mut self, begin: u64, end: u64) -> Option<&mut Span> {
        self.spans
            .iter_mut()
            .find(|s| s.begin <= begin && end <= s.end)
    }
}

/// Fixed-size set of range-tagged sub-buffers, each holding at most
/// `span_capacity` bytes.
pub struct StreamBuffer {
    inner: Mutex<Spans>,
    max_spans: usize,
    span_capacity: usize,
}

impl StreamBuffer {
    pub fn new(max_spans: usize, span_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Spans { spans: Vec::new() }),
            max_spans,
            span_capacity,
        }
    }

    /// Reserve `[begin, end)` for writing.
    ///
    /// A range touching or overlapping an existing span extends that span
    /// in place when the result still fits one sub-buffer (and marks it
    /// unready until the new bytes are committed). Returns false when every
    /// sub-buffer is taken; the caller backs off until the collector frees
    /// one.
    pub fn reserve(&self, begin: u64, end: u64) -> bool {
        debug_assert!(begin < end);
        if (end - begin) as usize > self.span_capacity {
            tracing::warn!("Range [{}, {}) exceeds sub-buffer capacity", begin, end);
            return false;
        }
        let mut inner = self.inner.lock().unwrap();

        let mergeable = inner.spans.iter_mut().find(|s| {
            begin <= s.end
                && s.begin <= end
                && (s.end.max(end) - s.begin.min(begin)) as usize <= self.span_capacity
        });
        if let Some(span) = mergeable {
            let new_begin = span.begin.min(begin);
            let new_end = span.end.max(end);
            let mut data = vec![0; (new_end - new_begin) as usize];
            let at = (span.begin - new_begin) as usize;
            data[at..at + span.data.len()].copy_from_slice(&span.data);
            span.begin = new_begin;
            span.end = new_end;
            span.data = data;
            span.ready = false;
            return true;
        }

        if inner.spans.len() >= self.max_spans {
            tracing::warn!(
                "Stream buffer full ({} spans), cannot reserve [{}, {})",
                inner.spans.len(),
                begin,
                end
            );
            return false;
        }
        inner.spans.push(Span {
            begin,
            end,
            data: vec![0; (end - begin) as usize],
            ready: false,
            hotness: 0.0,
        });
        true
    }

    /// Copy `bytes` into a previously reserved range. Returns false when no
    /// span covers the destination.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> bool {
        let end = offset + bytes.len() as u64;
        let mut inner = self.inner.lock().unwrap();
        match inner.find(offset, end) {
            Some(span) => {
                let at = (offset - span.begin) as usize;
                span.data[at..at + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Mark a reserved range readable.
    pub fn commit(&self, begin: u64, end: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.find(begin, end) {
            Some(span) => {
                span.ready = true;
                true
            }
            None => false,
        }
    }

    /// Copy out `[begin, end)` if a ready span contains it, bumping that
    /// span's hotness. `None` means not available now.
    pub fn read(&self, begin: u64, end: u64) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let span = inner.find(begin, end).filter(|s| s.ready)?;
        span.hotness += 1.0;
        let at = (begin - span.begin) as usize;
        Some(span.data[at..at + (end - begin) as usize].to_vec())
    }

    /// Halve every span's hotness and free ready spans that have decayed
    /// below the floor. Returns the number freed.
    pub fn collect(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.spans.len();
        for span in &mut inner.spans {
            span.hotness *= 0.5;
        }
        inner
            .spans
            .retain(|s| !s.ready || s.hotness > HOTNESS_FLOOR);
        before - inner.spans.len()
    }

    pub fn span_count(&self) -> usize {
        self.inner.lock().unwrap().spans.len()
    }

    pub fn is_full(&self) -> bool {
        self.span_count() >= self.max_spans
    }

    fn total_bytes(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .spans
            .iter()
            .map(|s| s.data.len())
            .sum()
    }

    fn clear(&self) {
        self.inner.lock().unwrap().spans.clear();
    }
}

// ============================================================================
// Stream resource and loader
// ============================================================================

/// A continuously delivered resource whose bytes live in a [`StreamBuffer`].
pub struct StreamResource {
    core: ResourceCore,
    buffer: StreamBuffer,
}

impl StreamResource {
    pub fn new(uri: &str, max_spans: usize, span_capacity: usize) -> Self {
        Self {
            core: ResourceCore::new(uri),
            buffer: StreamBuffer::new(max_spans, span_capacity),
        }
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// Playback-side read. On a miss the paused loader is nudged with
    /// `resume` so the range shows up on a later poll.
    pub fn read(&self, sched: &Scheduler, begin: u64, end: u64) -> Option<Vec<u8>> {
        match self.buffer.read(begin, end) {
            Some(data) => Some(data),
            None => {
                if let Some(ready) = self.core.tasks().ready {
                    let _ = sched.resume(ready);
                }
                None
            }
        }
    }
}

impl Resource for StreamResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn release_bulk(&self) {
        self.buffer.clear();
    }

    fn bulk_bytes(&self) -> usize {
        self.buffer.total_bytes()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Incremental loader: one pulled chunk per produce step, parked when the
/// stream buffer is full.
pub struct StreamLoader {
    res: Arc<StreamResource>,
    source: Box<dyn ByteSource>,
    offset: u64,
    /// Chunk pulled but not yet stored (buffer was full)
    pending: Option<(u64, Vec<u8>)>,
}

impl StreamLoader {
    pub fn new(res: Arc<StreamResource>, source: Box<dyn ByteSource>) -> Self {
        Self {
            res,
            source,
            offset: 0,
            pending: None,
        }
    }

    fn store(&self, offset: u64, chunk: &[u8]) -> bool {
        let end = offset + chunk.len() as u64;
        let buffer = self.res.buffer();
        if !buffer.reserve(offset, end) {
            return false;
        }
        buffer.write(offset, chunk);
        buffer.commit(offset, end);
        true
    }

    fn produce(&mut self) -> RunOutcome {
        self.res.core().mark_producing();

        // A chunk parked on a full buffer must land before pulling more.
        if let Some((offset, chunk)) = self.pending.take() {
            if !self.store(offset, &chunk) {
                self.pending = Some((offset, chunk));
                return RunOutcome::Park;
            }
        }

        let mut buf = [0u8; CHUNK];
        match self.source.pull(&mut buf) {
            Pull::NotReady => RunOutcome::Retry,
            Pull::Data(n) => {
                let offset = self.offset;
                self.offset += n as u64;
                let chunk = buf[..n].to_vec();
                if self.store(offset, &chunk) {
                    RunOutcome::Retry
                } else {
                    self.pending = Some((offset, chunk));
                    RunOutcome::Park
                }
            }
            Pull::Eof => {
                // An abort landed mid-run if the transition fails; leave
                // the state alone and publish nothing.
                if self.res.core().transition(LoadState::Loading, LoadState::Ready) {
                    self.res.core().install_commit(Box::new(self.offset));
                } else {
                    self.pending = None;
                }
                RunOutcome::Done
            }
        }
    }
}

impl Task for StreamLoader {
    fn run(&mut self, _sched: &Scheduler) -> RunOutcome {
        if self.res.core().state() == LoadState::Aborted {
            let _ = self.res.core().take_commit();
            self.pending = None;
            return RunOutcome::Done;
        }
        match self.res.core().take_commit() {
            Some(total) => {
                if self.res.core().transition(LoadState::Ready, LoadState::Loaded) {
                    if let Ok(total) = total.downcast::<u64>() {
                        tracing::debug!("{}: stream complete ({} bytes)", self.res.core().uri(), total);
                    }
                }
                RunOutcome::Done
            }
            None => self.produce(),
        }
    }
}

/// Register the `.aud` factory pair on a cache.
pub fn add_stream_factory<F>(cache: &ResourceCache, max_spans: usize, open: F)
where
    F: Fn(&str) -> Option<Box<dyn ByteSource>> + Send + Sync + 'static,
{
    cache.add_factory(
        Box::new(move |uri| {
            if !uri.ends_with(".aud") {
                return None;
            }
            Some(Arc::new(StreamResource::new(uri, max_spans, CHUNK)) as Arc<dyn Resource>)
        }),
        Box::new(move |res, cache| {
            let Ok(res) = Arc::clone(res).as_any_arc().downcast::<StreamResource>() else {
                return false;
            };
            let Some(source) = open(res.core().uri()) else {
                return false;
            };
            let loader = shared(StreamLoader::new(res.clone(), source));
            submit_loader(cache.scheduler(), res.core(), loader).is_ok()
        }),
    );
}
