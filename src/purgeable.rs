//! Purgeable memory objects: reclaim-eligible regions with lazy rebuild.
//!
//! A [`PurgeableMem`] binds an anonymous data mapping, its page-table view,
//! a rebuild chain and a reader/writer lock. The kernel may reclaim the
//! region's physical pages at any moment the object holds no refcount on
//! them; the next access detects the loss and replays the chain into a
//! zeroed buffer before handing out a guard.
//!
//! # Access protocol
//!
//! Every access first pins the content range (refcount increment on each
//! page), then takes the lock:
//!
//! - [`begin_read`](PurgeableMem::begin_read) loops: under the read lock,
//!   content that is built and present is returned immediately. Otherwise
//!   the read lock is dropped, the chain is replayed under the write lock
//!   (re-checking, since a racing thread may have won), and the read
//!   attempt restarts.
//! - [`begin_write`](PurgeableMem::begin_write) takes the write lock
//!   directly and replays there if needed.
//!
//! Dropping the returned guard ends the access: release the lock, then
//! unpin. Between guard creation and drop every page of the content range
//! is pinned and present.
//!
//! # Example
//!
//! ```rust,ignore
//! use purgemem::PurgeableMem;
//!
//! let image = PurgeableMem::new(1 << 20, |data: &mut [u8]| {
//!     decode_into(data); // deterministic: same bytes every replay
//!     true
//! })?;
//!
//! let pixels = image.begin_read()?;
//! render(&pixels);
//! drop(pixels); // unpinned; the kernel may reclaim again
//! ```

use crate::builder::{BuildStep, BuilderChain};
use crate::error::{Error, Result};
use crate::page;
use crate::probe;
use crate::uxpt::UxPageTable;
use rustix::mm::{MapFlags, ProtFlags};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Rebuild state guarded by the object's reader/writer lock.
struct BuildState {
    chain: BuilderChain,
    /// Successful (re)builds so far; zero means never materialized.
    build_count: u64,
    /// Set by [`PurgeableMem::purge`]; cleared by the next successful build.
    discarded: bool,
}

/// Outcome of the read-path fast attempt.
enum TryRead<'a> {
    /// Content is built and present; the read lock rides along.
    Ready(RwLockReadGuard<'a, BuildState>),
    /// Content needs a rebuild; the read lock has been released.
    Purged,
}

/// A memory region the kernel may reclaim and the owner can rebuild.
///
/// The object owns its data mapping and page-table window; both are
/// released when it is dropped (or explicitly via [`destroy`]).
///
/// [`destroy`]: PurgeableMem::destroy
pub struct PurgeableMem {
    data: NonNull<u8>,
    /// Mapped length (requested size rounded up to a page boundary).
    map_len: usize,
    /// Caller-visible content length.
    content_len: usize,
    uxpt: UxPageTable,
    state: RwLock<BuildState>,
    released: bool,
}

// SAFETY: the region is only dereferenced through guards holding the state
// lock (shared for reads, exclusive for writes and rebuilds); page-table
// entries are atomics. No thread-affine state is held.
unsafe impl Send for PurgeableMem {}
unsafe impl Sync for PurgeableMem {}

impl PurgeableMem {
    /// Map a purgeable region of `len` bytes and materialize its content.
    ///
    /// `step` produces the initial content: it runs once here against the
    /// zeroed buffer and becomes the head of the rebuild chain, so every
    /// later replay reproduces it. After a successful return
    /// [`build_count`](Self::build_count) is 1.
    ///
    /// On kernels without purgeable-mapping support the region is a plain
    /// private mapping and is never reclaimed.
    ///
    /// # Errors
    ///
    /// Fails on `len == 0`, on mapping failure, or if `step` itself fails;
    /// everything acquired up to the failure is released again.
    pub fn new(len: usize, step: impl BuildStep + 'static) -> Result<Self> {
        if len == 0 {
            return Err(Error::ZeroSize);
        }
        let map_len = page::round_up(len, page::page_size()).ok_or(Error::SizeOverflow(len))?;

        let flags = if probe::uxpt_supported() {
            MapFlags::from_bits_retain(probe::MAP_PURGEABLE)
        } else {
            MapFlags::PRIVATE
        };
        // SAFETY: fresh kernel-chosen anonymous mapping.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                flags,
            )
        }
        .map_err(Error::MapData)?;
        let data =
            NonNull::new(ptr.cast::<u8>()).ok_or(Error::MapData(rustix::io::Errno::INVAL))?;

        let uxpt = match UxPageTable::init(data.as_ptr() as u64, map_len) {
            Ok(table) => table,
            Err(err) => {
                // SAFETY: mapped above with this exact length; released once.
                if let Err(err) = unsafe { rustix::mm::munmap(data.as_ptr().cast(), map_len) } {
                    tracing::error!("unwinding data mapping failed: {}", err);
                }
                return Err(err);
            }
        };

        let mem = Self {
            data,
            map_len,
            content_len: len,
            uxpt,
            state: RwLock::new(BuildState {
                chain: BuilderChain::new(),
                build_count: 0,
                discarded: false,
            }),
            released: false,
        };
        tracing::debug!(
            "created purgeable region {:p}+{} (mapped {})",
            mem.data.as_ptr(),
            mem.content_len,
            mem.map_len
        );
        // Counts as the first build; `mem` unwinds the mappings on failure.
        mem.append_modify(step)?;
        Ok(mem)
    }

    /// Begin a shared access window.
    ///
    /// Rebuilds first if the content was purged (or never built). The
    /// content range stays pinned and the read lock held until the guard
    /// drops.
    ///
    /// # Errors
    ///
    /// Fails only if a rebuild was needed and the chain failed; the object
    /// stays usable and a later access retries the rebuild.
    pub fn begin_read(&self) -> Result<ReadGuard<'_>> {
        self.pin()?;
        loop {
            match self.try_begin_read() {
                Ok(TryRead::Ready(lock)) => {
                    return Ok(ReadGuard {
                        mem: self,
                        lock: Some(lock),
                    })
                }
                Ok(TryRead::Purged) => {}
                Err(err) => {
                    self.unpin();
                    return Err(err);
                }
            }
            // Purged: rebuild, then retry the read path from the top. A
            // racing thread may rebuild first (the retry succeeds at once)
            // or the kernel may purge again between the locks (the loop
            // rebuilds again); either way each pass makes progress.
            if let Err(err) = self.rebuild_if_purged() {
                self.unpin();
                return Err(err);
            }
        }
    }

    /// Begin an exclusive access window.
    ///
    /// Rebuilds first if the content was purged. The content range stays
    /// pinned and the write lock held until the guard drops.
    pub fn begin_write(&self) -> Result<WriteGuard<'_>> {
        self.pin()?;
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(_) => {
                tracing::error!("write lock poisoned");
                self.unpin();
                return Err(Error::LockPoisoned);
            }
        };
        if self.is_purged(&state) {
            if let Err(err) = self.build_data(&mut state) {
                drop(state);
                self.unpin();
                return Err(err);
            }
        }
        Ok(WriteGuard {
            mem: self,
            lock: Some(state),
        })
    }

    /// Apply an edit to the live content and record it for future rebuilds.
    ///
    /// Runs under the write lock. If the content was purged it is rebuilt
    /// first, so `step` always edits valid bytes. On success the step is
    /// appended to the chain (later edits replay after, and thus supersede,
    /// earlier ones); on failure the chain is left untouched.
    pub fn append_modify(&self, step: impl BuildStep + 'static) -> Result<()> {
        self.pin()?;
        let result = self.append_modify_locked(Box::new(step));
        self.unpin();
        result
    }

    fn append_modify_locked(&self, step: Box<dyn BuildStep>) -> Result<()> {
        let mut state = self.state.write().map_err(|_| {
            tracing::error!("write lock poisoned");
            Error::LockPoisoned
        })?;
        if self.is_purged(&state) {
            self.build_data(&mut state)?;
        }
        // SAFETY: the write lock is held.
        let data = unsafe { self.content_mut() };
        if !step.apply(data) {
            return Err(Error::BuildFailed {
                step: state.chain.len(),
            });
        }
        state.chain.append(step);
        Ok(())
    }

    /// Caller-visible content size in bytes.
    pub fn content_size(&self) -> usize {
        self.content_len
    }

    /// Number of successful (re)builds so far.
    pub fn build_count(&self) -> u64 {
        self.state.read().map(|state| state.build_count).unwrap_or(0)
    }

    /// Drop the built content, as the kernel would under memory pressure.
    ///
    /// Zeroes the content and marks the object purged under the write lock;
    /// the next access replays the chain. Pinned accesses are unaffected:
    /// this blocks until no guard is held. Useful for testing rebuild paths
    /// and for returning memory eagerly on kernels without reclaim support.
    pub fn purge(&self) {
        let Ok(mut state) = self.state.write() else {
            tracing::error!("write lock poisoned");
            return;
        };
        // SAFETY: the write lock is held.
        unsafe { self.content_mut() }.fill(0);
        state.discarded = true;
    }

    /// Release the data mapping and page-table window, reporting success.
    ///
    /// Equivalent to dropping the object, except the caller learns whether
    /// every release step succeeded.
    pub fn destroy(mut self) -> bool {
        self.release()
        // `self` drops here; `release` is idempotent.
    }

    /// Shared-read fast path: take the read lock and keep it only if the
    /// content is built and present.
    fn try_begin_read(&self) -> Result<TryRead<'_>> {
        let lock = self.state.read().map_err(|_| {
            tracing::error!("read lock poisoned");
            Error::LockPoisoned
        })?;
        if !self.is_purged(&lock) {
            return Ok(TryRead::Ready(lock));
        }
        drop(lock);
        Ok(TryRead::Purged)
    }

    /// Replay the chain under the write lock unless a racing thread already
    /// rebuilt the content.
    fn rebuild_if_purged(&self) -> Result<()> {
        let mut state = self.state.write().map_err(|_| {
            tracing::error!("write lock poisoned");
            Error::LockPoisoned
        })?;
        if self.is_purged(&state) {
            self.build_data(&mut state)?;
        }
        Ok(())
    }

    /// Whether content must be (re)built before it may be handed out.
    ///
    /// Never-built and explicitly purged objects count as purged; otherwise
    /// the page-table presence of the content range decides. Without kernel
    /// support presence always reads true, so only the first access builds.
    fn is_purged(&self, state: &BuildState) -> bool {
        if state.build_count == 0 || state.discarded {
            return true;
        }
        !self
            .uxpt
            .is_present(self.data.as_ptr() as u64, self.content_len)
    }

    /// Zero the content and replay the chain. Caller holds the write lock.
    fn build_data(&self, state: &mut BuildState) -> Result<()> {
        // SAFETY: the write lock is held.
        let data = unsafe { self.content_mut() };
        data.fill(0);
        state.chain.build_all(data)?;
        state.build_count += 1;
        state.discarded = false;
        Ok(())
    }

    /// Pin the content range against reclaim.
    fn pin(&self) -> Result<()> {
        self.uxpt.get(self.data.as_ptr() as u64, self.content_len)
    }

    /// Release the pin taken by [`pin`](Self::pin).
    fn unpin(&self) {
        if let Err(err) = self.uxpt.put(self.data.as_ptr() as u64, self.content_len) {
            tracing::error!("unpinning content range failed: {}", err);
        }
    }

    /// Mutable view of the content bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold the state write lock (or otherwise have
    /// exclusive access, as in the release path).
    #[allow(clippy::mut_from_ref)]
    unsafe fn content_mut(&self) -> &mut [u8] {
        // SAFETY: the mapping is live for `self`'s lifetime; exclusivity is
        // the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.content_len) }
    }

    /// Release sequence: chain, data mapping, presence post-check, window.
    /// Idempotent; returns whether every step succeeded.
    fn release(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;
        let mut ok = true;

        // Drop the chain before the region it rebuilds disappears.
        match self.state.write() {
            Ok(mut state) => state.chain = BuilderChain::new(),
            Err(_) => tracing::error!("lock poisoned at release; dropping chain with it"),
        }

        let addr = self.data.as_ptr() as u64;
        // SAFETY: mapped in `new` with this exact length; `released` keeps
        // this from running twice.
        if let Err(err) = unsafe { rustix::mm::munmap(self.data.as_ptr().cast(), self.map_len) } {
            tracing::error!("unmapping data region failed: {}", err);
            ok = false;
        } else if probe::uxpt_supported() && self.uxpt.is_present(addr, self.content_len) {
            // The kernel clears presence when the data mapping goes away.
            tracing::error!("data region unmapped but entries still read present");
        }

        if let Err(err) = self.uxpt.deinit() {
            tracing::error!("releasing page-table window failed: {}", err);
            ok = false;
        }
        ok
    }
}

impl Drop for PurgeableMem {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PurgeableMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeableMem")
            .field("data", &self.data.as_ptr())
            .field("content_len", &self.content_len)
            .field("map_len", &self.map_len)
            .field("build_count", &self.build_count())
            .finish()
    }
}

/// Shared access window into a [`PurgeableMem`].
///
/// Derefs to the content bytes. While the guard lives, every page of the
/// content range is pinned and present and the read lock is held; dropping
/// it releases the lock, then the pin.
pub struct ReadGuard<'a> {
    mem: &'a PurgeableMem,
    lock: Option<RwLockReadGuard<'a, BuildState>>,
}

impl Deref for ReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the read lock is held for the guard's lifetime, so no
        // rebuild or exclusive writer can touch the bytes.
        unsafe { std::slice::from_raw_parts(self.mem.data.as_ptr(), self.mem.content_len) }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.take();
        self.mem.unpin();
    }
}

/// Exclusive access window into a [`PurgeableMem`].
///
/// Derefs to the content bytes, mutably. Edits made through the guard are
/// *not* recorded in the rebuild chain; callers that need an edit to
/// survive a purge should register it with
/// [`append_modify`](PurgeableMem::append_modify) instead (or as well).
pub struct WriteGuard<'a> {
    mem: &'a PurgeableMem,
    lock: Option<RwLockWriteGuard<'a, BuildState>>,
}

impl Deref for WriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the write lock is held for the guard's lifetime.
        unsafe { std::slice::from_raw_parts(self.mem.data.as_ptr(), self.mem.content_len) }
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: the write lock is held for the guard's lifetime, giving
        // this guard exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.mem.data.as_ptr(), self.mem.content_len) }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.take();
        self.mem.unpin();
    }
}
