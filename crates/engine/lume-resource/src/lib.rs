//! Lume Resource Pipeline
//!
//! URI-keyed resource cache and the two-phase loader convention for the
//! Lume content runtime, built on `lume-sched`.
//!
//! Resources are created once per distinct URI, loaded asynchronously by a
//! produce phase on the worker pool and a commit phase on the owner thread,
//! and evicted by hotness decay when nobody references them.
//!
//! # Example
//! ```rust,ignore
//! use std::sync::Arc;
//! use lume_resource::{add_texture_factory, CacheConfig, NullDevice, ResourceCache, TextureResource};
//! use lume_sched::{SchedConfig, Scheduler};
//!
//! let sched = Scheduler::new(SchedConfig::default());
//! let cache = ResourceCache::new(sched, CacheConfig::default());
//! let device = Arc::new(NullDevice::new());
//! add_texture_factory(&cache, device, |uri| open_source(uri));
//!
//! let tex = cache.load_as::<TextureResource>("ui/logo.tex")?;
//! ```

mod cache;
mod config;
mod error;
mod loader;
mod resource;
mod state;
mod stream;
mod texture;

pub use cache::{CacheStats, CreateFn, LoadFn, ResourceCache};
pub use config::CacheConfig;
pub use error::ResourceError;
pub use loader::{
    submit_loader, ByteSource, DeviceContext, DeviceHandle, MemorySource, NullDevice, Pull,
};
pub use resource::{Continuation, Handle, LoaderTasks, Resource, ResourceCore};
pub use state::{AtomicLoadState, LoadState};
pub use stream::{add_stream_factory, StreamBuffer, StreamLoader, StreamResource};
pub use texture::{add_texture_factory, encode_ltex, TextureLoader, TextureResource};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
