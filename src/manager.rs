//! Process-wide cache of live purgeable objects.
//!
//! Applications holding many purgeable resources (decoded images, parsed
//! blobs) want the recently used ones materialized ahead of a burst of
//! accesses instead of paying a rebuild on each first touch. The manager
//! keeps a capacity-bounded most-recently-used list of live objects and
//! [`warm`](ResourceManager::warm) replays any purged ones on a small
//! worker pool.
//!
//! The manager holds [`Arc`]s, so cached objects stay alive until they are
//! removed or evicted; it never decides *when* the kernel purges, only what
//! gets rebuilt eagerly.

use crate::purgeable::PurgeableMem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

const DEFAULT_CAPACITY: usize = 500;
const MIN_CAPACITY: usize = 1;
const MAX_CAPACITY: usize = 2000;

const DEFAULT_WORKERS: usize = 4;
const MIN_WORKERS: usize = 1;
const MAX_WORKERS: usize = 20;

/// Capacity-bounded list of purgeable objects, most recently used first.
struct LruCache {
    capacity: usize,
    /// Front = most recent. Small enough (≤ [`MAX_CAPACITY`]) that linear
    /// scans beat pointer-keyed maps.
    entries: Vec<Arc<PurgeableMem>>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
        }
    }

    fn position(&self, res: &Arc<PurgeableMem>) -> Option<usize> {
        self.entries.iter().position(|e| Arc::ptr_eq(e, res))
    }

    /// Move an already-cached object to the most-recent position.
    fn visit(&mut self, res: &Arc<PurgeableMem>) {
        if let Some(pos) = self.position(res) {
            let entry = self.entries.remove(pos);
            self.entries.insert(0, entry);
        }
    }

    /// Insert (or re-front) an object, evicting the least recent beyond
    /// capacity.
    fn insert(&mut self, res: Arc<PurgeableMem>) {
        if let Some(pos) = self.position(&res) {
            self.entries.remove(pos);
        }
        self.entries.insert(0, res);
        self.entries.truncate(self.capacity);
    }

    fn remove(&mut self, res: &Arc<PurgeableMem>) {
        if let Some(pos) = self.position(res) {
            self.entries.remove(pos);
        }
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.entries.truncate(self.capacity);
    }
}

/// Shared manager over an LRU cache of purgeable objects.
///
/// All methods take `&self`; the cache lives behind a mutex. Worker count
/// and capacity are clamped to sane bounds at construction.
pub struct ResourceManager {
    cache: Mutex<LruCache>,
    workers: usize,
}

impl ResourceManager {
    /// Manager with default capacity (500) and worker count (4).
    pub fn new() -> Self {
        Self::with_config(DEFAULT_CAPACITY, DEFAULT_WORKERS)
    }

    /// Manager with explicit capacity (clamped to 1..=2000) and worker
    /// count (clamped to 1..=20).
    pub fn with_config(capacity: usize, workers: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity.clamp(MIN_CAPACITY, MAX_CAPACITY))),
            workers: workers.clamp(MIN_WORKERS, MAX_WORKERS),
        }
    }

    /// The process-wide manager instance.
    pub fn global() -> &'static ResourceManager {
        static GLOBAL: OnceLock<ResourceManager> = OnceLock::new();
        GLOBAL.get_or_init(ResourceManager::new)
    }

    /// Cache an object at the most-recent position.
    pub fn add(&self, res: Arc<PurgeableMem>) {
        self.lock().insert(res);
    }

    /// Drop an object from the cache (the object itself lives on while
    /// other `Arc`s do).
    pub fn remove(&self, res: &Arc<PurgeableMem>) {
        self.lock().remove(res);
    }

    /// Mark an object as just-used, moving it to the most-recent position.
    pub fn touch(&self, res: &Arc<PurgeableMem>) {
        self.lock().visit(res);
    }

    /// Change the cache capacity (clamped to 1..=2000), evicting the least
    /// recently used entries beyond it.
    pub fn set_capacity(&self, capacity: usize) {
        self.lock()
            .set_capacity(capacity.clamp(MIN_CAPACITY, MAX_CAPACITY));
    }

    /// Evict everything.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize every cached object, rebuilding purged content on a
    /// worker pool. Returns how many objects were successfully touched.
    ///
    /// Objects whose rebuild fails are skipped with a warning; they stay
    /// cached and a later access retries.
    pub fn warm(&self) -> usize {
        let snapshot: Vec<_> = self.lock().entries.clone();
        if snapshot.is_empty() {
            return 0;
        }
        let cursor = AtomicUsize::new(0);
        let warmed = AtomicUsize::new(0);
        let workers = self.workers.min(snapshot.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(res) = snapshot.get(idx) else { break };
                    match res.begin_read() {
                        Ok(guard) => {
                            drop(guard);
                            warmed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => tracing::warn!("warming purgeable object failed: {}", err),
                    }
                });
            }
        });
        warmed.into_inner()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache> {
        // A poisoned cache list is still structurally sound.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
