//! Texture Resource
//!
//! Loads `LTEX` images: a 12-byte header (`b"LTEX"`, width u32le, height
//! u32le) followed by `width * height * 4` RGBA bytes. The produce phase
//! accumulates and validates bytes on any worker; the commit phase creates
//! the device image on the owner thread and publishes it.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lume_sched::{shared, RunOutcome, Scheduler, Task};

use crate::cache::ResourceCache;
use crate::loader::{submit_loader, ByteSource, DeviceContext, DeviceHandle, Pull};
use crate::resource::{Resource, ResourceCore};
use crate::state::LoadState;

const MAGIC: &[u8; 4] = b"LTEX";
const HEADER_LEN: usize = 12;

/// A cached 2D image backed by a device-owned object.
pub struct TextureResource {
    core: ResourceCore,
    device: Arc<dyn DeviceContext>,
    width: AtomicU32,
    height: AtomicU32,
    image: Mutex<Option<DeviceHandle>>,
}

impl TextureResource {
    pub fn new(uri: &str, device: Arc<dyn DeviceContext>) -> Self {
        Self {
            core: ResourceCore::new(uri),
            device,
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            image: Mutex::new(None),
        }
    }

    pub fn width(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// The device image, once the commit phase has published it.
    pub fn image(&self) -> Option<DeviceHandle> {
        *self.image.lock().unwrap()
    }
}

impl Resource for TextureResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    /// Destroy the device image; dimensions survive so the entry keeps its
    /// identity across eviction.
    fn release_bulk(&self) {
        if let Some(handle) = self.image.lock().unwrap().take() {
            self.device.destroy(handle);
        }
    }

    fn bulk_bytes(&self) -> usize {
        if self.image.lock().unwrap().is_some() {
            self.width() as usize * self.height() as usize * 4
        } else {
            0
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Decoded pixels handed from the produce phase to the commit phase
struct TexturePayload {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

/// Two-phase loader for [`TextureResource`].
pub struct TextureLoader {
    res: Arc<TextureResource>,
    source: Box<dyn ByteSource>,
    bytes: Vec<u8>,
    /// Parsed from the header once 12 bytes have arrived
    dims: Option<(u32, u32)>,
}

impl TextureLoader {
    pub fn new(res: Arc<TextureResource>, source: Box<dyn ByteSource>) -> Self {
        Self {
            res,
            source,
            bytes: Vec::new(),
            dims: None,
        }
    }

    fn abort(&mut self, reason: &str) -> RunOutcome {
        tracing::warn!("{}: {}", self.res.core().uri(), reason);
        self.bytes = Vec::new();
        self.res.core().set_state(LoadState::Aborted);
        // An empty payload still routes the dependent slot through the
        // cleanup path exactly once.
        self.res.core().install_commit(Box::new(()));
        RunOutcome::Done
    }

    /// Release loader-held data after an external abort, publishing nothing.
    fn cleanup(&mut self) -> RunOutcome {
        let _ = self.res.core().take_commit();
        self.bytes = Vec::new();
        RunOutcome::Done
    }

    /// Validate the header and publish the dimensions. Dimensions become
    /// readable as soon as the resource reaches `Ready`, before any pixel
    /// data exists.
    fn parse_header(&mut self) -> Result<(), &'static str> {
        if &self.bytes[..4] != MAGIC {
            return Err("bad texture magic");
        }
        let width = u32::from_le_bytes(self.bytes[4..8].try_into().unwrap());
        let height = u32::from_le_bytes(self.bytes[8..12].try_into().unwrap());
        if width == 0 || height == 0 {
            return Err("zero texture dimension");
        }
        self.dims = Some((width, height));
        self.res.width.store(width, Ordering::Release);
        self.res.height.store(height, Ordering::Release);
        Ok(())
    }

    fn produce(&mut self) -> RunOutcome {
        self.res.core().mark_producing();
        let mut buf = [0u8; 8192];
        loop {
            match self.source.pull(&mut buf) {
                Pull::NotReady => return RunOutcome::Retry,
                Pull::Data(n) => {
                    self.bytes.extend_from_slice(&buf[..n]);
                    if self.dims.is_none() && self.bytes.len() >= HEADER_LEN {
                        if let Err(reason) = self.parse_header() {
                            return self.abort(reason);
                        }
                        // A failed transition means an abort landed mid-run;
                        // it must not be overwritten.
                        if !self.res.core().transition(LoadState::Loading, LoadState::Ready) {
                            return self.cleanup();
                        }
                    }
                }
                Pull::Eof => break,
            }
        }

        let Some((width, height)) = self.dims else {
            return self.abort("truncated texture header");
        };
        let expected = HEADER_LEN + width as usize * height as usize * 4;
        if self.bytes.len() != expected {
            return self.abort("texture pixel data length mismatch");
        }
        if self.res.core().state() == LoadState::Aborted {
            return self.cleanup();
        }

        let pixels = std::mem::take(&mut self.bytes);
        self.res.core().install_commit(Box::new(TexturePayload {
            width,
            height,
            pixels: pixels[HEADER_LEN..].to_vec(),
        }));
        RunOutcome::Done
    }

    fn commit(&mut self, sched: &Scheduler, payload: TexturePayload) -> RunOutcome {
        debug_assert!(sched.is_owner_thread(), "device commit off the owner thread");
        let handle = self
            .res
            .device
            .create_image(payload.width, payload.height, &payload.pixels);
        // Publish only while still Ready; an abort that landed after the
        // produce phase wins, and the fresh device object is rolled back
        // before anyone can observe it.
        let mut image = self.res.image.lock().unwrap();
        if self.res.core().transition(LoadState::Ready, LoadState::Loaded) {
            *image = Some(handle);
            tracing::debug!(
                "{}: texture loaded ({}x{})",
                self.res.core().uri(),
                payload.width,
                payload.height
            );
        } else {
            self.res.device.destroy(handle);
        }
        RunOutcome::Done
    }
}

impl Task for TextureLoader {
    fn run(&mut self, sched: &Scheduler) -> RunOutcome {
        // Aborted externally: release loader-held data, publish nothing.
        if self.res.core().state() == LoadState::Aborted {
            return self.cleanup();
        }
        match self.res.core().take_commit() {
            Some(payload) => match payload.downcast::<TexturePayload>() {
                Ok(payload) => self.commit(sched, *payload),
                // Cleanup-only payload from an aborted produce phase
                Err(_) => RunOutcome::Done,
            },
            None => self.produce(),
        }
    }
}

/// Register the `.tex` factory pair on a cache.
///
/// `open` maps a URI to its byte source; returning `None` fails the load.
pub fn add_texture_factory<F>(cache: &ResourceCache, device: Arc<dyn DeviceContext>, open: F)
where
    F: Fn(&str) -> Option<Box<dyn ByteSource>> + Send + Sync + 'static,
{
    cache.add_factory(
        Box::new(move |uri| {
            if !uri.ends_with(".tex") {
                return None;
            }
            Some(Arc::new(TextureResource::new(uri, Arc::clone(&device))) as Arc<dyn Resource>)
        }),
        Box::new(move |res, cache| {
            let Ok(res) = Arc::clone(res).as_any_arc().downcast::<TextureResource>() else {
                return false;
            };
            let Some(source) = open(res.core().uri()) else {
                return false;
            };
            let loader = shared(TextureLoader::new(res.clone(), source));
            submit_loader(cache.scheduler(), res.core(), loader).is_ok()
        }),
    );
}

/// Encode an `LTEX` image (tests and demos).
pub fn encode_ltex(width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
    assert_eq!(pixels.len(), width as usize * height as usize * 4);
    let mut out = Vec::with_capacity(HEADER_LEN + pixels.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(pixels);
    out
}
