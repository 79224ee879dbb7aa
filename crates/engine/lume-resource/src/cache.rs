//! Resource Cache
//!
//! URI-keyed, de-duplicating, reference-counted store. Entities are created
//! once per distinct URI and live until evicted or forgotten; concurrent
//! loads of the same URI resolve to one entity and one loader submission.
//!
//! The map mutex covers lookup/insert/erase only. Loader-internal state is
//! never under it; factory callbacks run with no cache lock held.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use lume_sched::Scheduler;

use crate::config::CacheConfig;
use crate::error::ResourceError;
use crate::resource::{Handle, Resource};
use crate::state::LoadState;

/// Allocate the typed resource for a URI, or decline it.
pub type CreateFn = Box<dyn Fn(&str) -> Option<Arc<dyn Resource>> + Send + Sync>;

/// Submit loader tasks for a freshly created (or re-fetched) resource.
/// Returns false when submission failed outright.
pub type LoadFn = Box<dyn Fn(&Arc<dyn Resource>, &ResourceCache) -> bool + Send + Sync>;

struct Factory {
    create: CreateFn,
    load: LoadFn,
}

struct Entry {
    res: Arc<dyn Resource>,
    /// Index of the factory that claimed the URI, for re-fetch after
    /// eviction
    factory: usize,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entry_count: usize,
    /// Entries with a loader in flight
    pub in_flight: usize,
    /// Bulk bytes held across all entries
    pub total_bulk_bytes: usize,
}

/// URI-keyed resource store
pub struct ResourceCache {
    sched: Arc<Scheduler>,
    entries: Mutex<BTreeMap<Arc<str>, Entry>>,
    factories: Mutex<Vec<Arc<Factory>>>,
    config: CacheConfig,
}

impl ResourceCache {
    pub fn new(sched: Arc<Scheduler>, config: CacheConfig) -> Self {
        Self {
            sched,
            entries: Mutex::new(BTreeMap::new()),
            factories: Mutex::new(Vec::new()),
            config,
        }
    }

    /// The scheduler loader tasks are submitted to.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Register a `(create, load)` factory pair. Pairs are tried in
    /// registration order until one claims the URI.
    pub fn add_factory(&self, create: CreateFn, load: LoadFn) {
        self.factories
            .lock()
            .unwrap()
            .push(Arc::new(Factory { create, load }));
    }

    fn factory_snapshot(&self) -> Vec<Arc<Factory>> {
        self.factories.lock().unwrap().clone()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Load (or join the in-flight load of) the resource for `uri`.
    ///
    /// A hit returns the existing entity; a miss runs the factory list, with
    /// the insert re-checked so two racing misses still converge on one
    /// entity and a single loader submission.
    pub fn load(&self, uri: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        let hit = {
            let entries = self.entries.lock().unwrap();
            entries.get(uri).map(|e| (Arc::clone(&e.res), e.factory))
        };
        if let Some((res, factory)) = hit {
            res.core().touch();
            // An evicted entry keeps its identity; re-fetch in place. The
            // transition arbitrates racing hits.
            if res.core().transition(LoadState::Unloaded, LoadState::NotLoaded) {
                tracing::debug!("{}: re-fetching evicted resource", uri);
                self.run_factory_load(factory, &res);
            }
            return Ok(res);
        }

        // Miss: run factories with no cache lock held.
        let factories = self.factory_snapshot();
        let mut created = None;
        for (index, factory) in factories.iter().enumerate() {
            if let Some(res) = (factory.create)(uri) {
                created = Some((index, res));
                break;
            }
        }
        let Some((index, res)) = created else {
            tracing::warn!("{}: no factory claimed URI", uri);
            return Err(ResourceError::UnclaimedUri(uri.to_string()));
        };

        {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(uri) {
                // Another thread inserted the same URI meanwhile: discard
                // ours and join theirs.
                Some(existing) => {
                    let existing = Arc::clone(&existing.res);
                    existing.core().touch();
                    return Ok(existing);
                }
                None => {
                    entries.insert(
                        res.core().interned_uri(),
                        Entry {
                            res: Arc::clone(&res),
                            factory: index,
                        },
                    );
                }
            }
        }

        res.core().touch();
        self.run_factory_load(index, &res);
        Ok(res)
    }

    /// Typed convenience over [`ResourceCache::load`].
    pub fn load_as<T: Resource>(&self, uri: &str) -> Result<Handle<T>, ResourceError> {
        let res = self.load(uri)?;
        res.as_any_arc()
            .downcast::<T>()
            .map(Handle::new)
            .map_err(|_| ResourceError::WrongType(uri.to_string()))
    }

    /// Existing entry for `uri`, if any, without triggering a load.
    pub fn get(&self, uri: &str) -> Option<Arc<dyn Resource>> {
        self.entries
            .lock()
            .unwrap()
            .get(uri)
            .map(|e| Arc::clone(&e.res))
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.lock().unwrap().contains_key(uri)
    }

    fn run_factory_load(&self, index: usize, res: &Arc<dyn Resource>) {
        let factory = self.factories.lock().unwrap().get(index).cloned();
        let Some(factory) = factory else { return };
        if !(factory.load)(res, self) {
            res.core().set_state(LoadState::Aborted);
            tracing::warn!("{}: loader submission failed", res.core().uri());
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop the map entry without waiting for outstanding tasks.
    ///
    /// Ownership passes to whichever holder still has a reference; in-flight
    /// commit phases tolerate operating on an unreachable resource.
    pub fn forget(&self, uri: &str) -> Option<Arc<dyn Resource>> {
        let removed = self.entries.lock().unwrap().remove(uri).map(|e| e.res);
        if removed.is_some() {
            tracing::debug!("{}: forgotten", uri);
        }
        removed
    }

    /// Evict loaded resources nobody outside the cache references and whose
    /// hotness has decayed to the floor. Returns the eviction count.
    ///
    /// Must be called from the owner thread: `release_bulk` destroys
    /// device-owned objects, and the device context is owner-thread-only.
    /// Evicted entries keep URI and metadata (`Unloaded`), so a later load
    /// re-fetches without losing identity.
    pub fn collect_infrequently_used(&self) -> usize {
        debug_assert!(
            self.sched.is_owner_thread(),
            "collection must run on the owner thread"
        );
        let entries = self.entries.lock().unwrap();
        let mut evicted = 0;
        for entry in entries.values() {
            let core = entry.res.core();
            core.decay();
            if core.state() == LoadState::Loaded
                && core.hotness() <= self.config.hotness_floor
                && Arc::strong_count(&entry.res) == 1
            {
                entry.res.release_bulk();
                core.set_state(LoadState::Unloaded);
                evicted += 1;
                tracing::debug!("{}: evicted", core.uri());
            }
        }
        evicted
    }

    /// Abort every in-flight loader for fast shutdown. Commit phases still
    /// run once for cleanup but never publish. Returns the abort count.
    pub fn abort_all_loaders(&self) -> usize {
        let targets: Vec<_> = {
            let entries = self.entries.lock().unwrap();
            entries
                .values()
                .filter(|e| e.res.core().state().is_in_flight())
                .map(|e| {
                    e.res.core().set_state(LoadState::Aborted);
                    e.res.core().tasks()
                })
                .collect()
        };

        let mut aborted = 0;
        for tasks in targets {
            if let Some(ready) = tasks.ready {
                let _ = self.sched.cancel_chain(ready);
            }
            aborted += 1;
        }
        if aborted > 0 {
            tracing::info!("Aborted {} in-flight loaders", aborted);
        }
        aborted
    }

    /// Snapshot of cache counters.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap();
        CacheStats {
            entry_count: entries.len(),
            in_flight: entries
                .values()
                .filter(|e| e.res.core().state().is_in_flight())
                .count(),
            total_bulk_bytes: entries.values().map(|e| e.res.bulk_bytes()).sum(),
        }
    }
}
