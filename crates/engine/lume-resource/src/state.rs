//! Resource Load States
//!
//! The load-state machine shared by every cached resource. States are stored
//! atomically so concurrent readers only ever observe whole transitions.

use std::sync::atomic::{AtomicU8, Ordering};

/// Load-state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    /// Created, no loader submitted yet
    NotLoaded = 0,
    /// Loader tasks submitted, produce phase in flight
    Loading = 1,
    /// Metadata known (e.g. image dimensions), bulk data still loading
    Ready = 2,
    /// Fully loaded and published
    Loaded = 3,
    /// Evicted: bulk data released, identity and metadata retained
    Unloaded = 4,
    /// Loading failed or was cancelled; never transitions out on its own
    Aborted = 5,
}

impl LoadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotLoaded,
            1 => Self::Loading,
            2 => Self::Ready,
            3 => Self::Loaded,
            4 => Self::Unloaded,
            _ => Self::Aborted,
        }
    }

    /// State name
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not-loaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
            Self::Aborted => "aborted",
        }
    }

    /// Whether a loader is currently responsible for this resource
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Loading | Self::Ready)
    }
}

/// Atomically readable/writable [`LoadState`]
#[derive(Debug)]
pub struct AtomicLoadState(AtomicU8);

impl AtomicLoadState {
    pub fn new(state: LoadState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> LoadState {
        LoadState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: LoadState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Store `next` only if the current state is `expected`.
    pub fn transition(&self, expected: LoadState, next: LoadState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
