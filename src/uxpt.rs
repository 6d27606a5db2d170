//! Per-page presence and refcount entries shared with the kernel.
//!
//! For every purgeable data region the kernel exposes a window of 64-bit
//! entries, one per data page. Bit 0 is the present bit, maintained by the
//! kernel: set while the backing page is resident, cleared when the page is
//! reclaimed. The bits above it hold a refcount stepped in units of
//! [`REFCNT_ONE`]; a non-zero refcount pins the page against reclaim. While
//! the kernel reclaims a page it publishes the [`UNDER_RECLAIM`] sentinel in
//! the entry, and increments must back off until it clears.
//!
//! Entries are mutated concurrently by every thread mapping the region and
//! by the kernel itself, so each update is a 64-bit compare-and-swap with a
//! full barrier ahead of the load.
//!
//! On kernels without the extension a [`UxPageTable`] still constructs, but
//! carries no window: refcount operations do nothing and presence always
//! reads as true.

use crate::error::{Error, Result};
use crate::page;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Low entry bits owned by the kernel (the present bit).
const PRESENT_BITS: u32 = 1;

/// Mask of the kernel-owned present bit.
const PRESENT_MASK: u64 = (1 << PRESENT_BITS) - 1;

/// Refcount increment unit; refcounts live above the present bit.
pub const REFCNT_ONE: u64 = 1 << PRESENT_BITS;

/// Entry value published by the kernel while it reclaims the page.
pub const UNDER_RECLAIM: u64 = 0u64.wrapping_sub(REFCNT_ONE);

/// Operations applied entry-by-entry over an address range.
#[derive(Clone, Copy)]
enum EntryOp {
    Get,
    Put,
    Clear,
    IsPresent,
}

/// The mapped entry window for one data region.
struct Window {
    ptr: NonNull<AtomicU64>,
    len: usize,
}

/// Page-table view over the data region `[data_addr, data_addr + data_size)`.
///
/// Owns the entry window mapping; unmapping happens through
/// [`UxPageTable::deinit`] (the owner's release path), not `Drop`, so the
/// owner controls release ordering relative to the data mapping.
pub struct UxPageTable {
    data_addr: u64,
    data_size: usize,
    entries: Option<Window>,
}

// SAFETY: the window is an array of atomics shared with the kernel; all
// accesses go through &AtomicU64. The raw pointer itself is never retargeted
// after init.
unsafe impl Send for UxPageTable {}
unsafe impl Sync for UxPageTable {}

impl UxPageTable {
    /// Map and zero the entry window for the given data region.
    ///
    /// On kernels without support this succeeds with no window; every
    /// operation then degrades to a no-op.
    pub fn init(data_addr: u64, data_size: usize) -> Result<Self> {
        #[cfg(feature = "uxpt")]
        if crate::probe::uxpt_supported() {
            let (ptr, len) = map_window(data_addr, data_size)?;
            let mut table = Self {
                data_addr,
                data_size,
                entries: Some(Window { ptr, len }),
            };
            if let Err(err) = table.clear(data_addr, data_size) {
                let _ = table.deinit();
                return Err(err);
            }
            return Ok(table);
        }
        Ok(Self {
            data_addr,
            data_size,
            entries: None,
        })
    }

    /// Unmap the entry window. Idempotent.
    pub fn deinit(&mut self) -> Result<()> {
        if let Some(window) = self.entries.take() {
            // SAFETY: window came from a successful mmap and is unmapped
            // exactly once (`take` cleared it).
            unsafe { rustix::mm::munmap(window.ptr.as_ptr().cast(), window.len) }
                .map_err(Error::UnmapTable)?;
        }
        Ok(())
    }

    /// Increment the refcount of every page in the range, pinning the pages
    /// against reclaim.
    pub fn get(&self, addr: u64, len: usize) -> Result<()> {
        self.walk(addr, len, EntryOp::Get).map(|_| ())
    }

    /// Decrement the refcount of every page in the range.
    pub fn put(&self, addr: u64, len: usize) -> Result<()> {
        self.walk(addr, len, EntryOp::Put).map(|_| ())
    }

    /// Store zero into every entry in the range.
    pub fn clear(&self, addr: u64, len: usize) -> Result<()> {
        self.walk(addr, len, EntryOp::Clear).map(|_| ())
    }

    /// Whether every page in the range has its present bit set.
    ///
    /// Out-of-range input reads as not present.
    pub fn is_present(&self, addr: u64, len: usize) -> bool {
        self.walk(addr, len, EntryOp::IsPresent).unwrap_or(false)
    }

    /// Apply `op` to every entry for `[round_down(addr), round_up(addr+len))`.
    ///
    /// Returns `Ok(false)` only for a failed presence check. Out-of-range
    /// input errors before any side effect.
    fn walk(&self, addr: u64, len: usize, op: EntryOp) -> Result<bool> {
        let Some(window) = &self.entries else {
            return Ok(true);
        };
        let page = page::page_size() as u64;
        let start = page::round_down(addr, page);
        let end = addr
            .checked_add(len as u64)
            .and_then(|end| page::round_up_addr(end, page))
            .ok_or(Error::OutOfRange { addr, len })?;
        if start < self.data_addr || end > self.data_addr + self.data_size as u64 {
            tracing::warn!(
                "range {:#x}+{} outside table region {:#x}+{}",
                addr,
                len,
                self.data_addr,
                self.data_size
            );
            return Err(Error::OutOfRange { addr, len });
        }

        for off in (start..end).step_by(page as usize) {
            let entry = self.entry(window, off);
            match op {
                EntryOp::Get => entry_add(entry, REFCNT_ONE),
                EntryOp::Put => entry_sub(entry, REFCNT_ONE),
                EntryOp::Clear => entry_clear(entry),
                EntryOp::IsPresent => {
                    if entry.load(Ordering::Acquire) & PRESENT_MASK == 0 {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Entry for the data page containing `addr`.
    ///
    /// The window starts at the table page holding the region's first entry,
    /// so indexing is relative to `data_addr`'s offset inside that page.
    fn entry<'a>(&self, window: &'a Window, addr: u64) -> &'a AtomicU64 {
        let index = page::entry_offset(self.data_addr)
            + (page::virt_page_no(addr) - page::virt_page_no(self.data_addr));
        debug_assert!(((index as usize) + 1) << page::ENTRY_SHIFT <= window.len);
        // SAFETY: `walk` range-checked `addr`, so `index` lies inside the
        // mapped window.
        unsafe { &*window.ptr.as_ptr().add(index as usize) }
    }
}

/// Load an entry behind a full barrier.
///
/// The kernel updates entries from reclaim context; the barrier keeps the
/// subsequent CAS honest about the freshest visible value.
fn load_sync(entry: &AtomicU64) -> u64 {
    fence(Ordering::SeqCst);
    entry.load(Ordering::Acquire)
}

/// CAS-loop an increment onto an entry.
///
/// Backs off (yielding the scheduler, never spinning) while the entry holds
/// the under-reclaim sentinel. Skips the increment entirely if it would
/// overflow the 64-bit entry.
fn entry_add(entry: &AtomicU64, inc: u64) {
    loop {
        let old = load_sync(entry);
        // Sentinel first: it sits at the top of the value range, so the
        // overflow check below would otherwise swallow it.
        if old == UNDER_RECLAIM {
            std::thread::yield_now();
            continue;
        }
        let Some(new) = old.checked_add(inc) else {
            tracing::warn!("entry {:#x} refcount increment would overflow", old);
            return;
        };
        if entry
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// CAS-loop an unconditional decrement onto an entry.
fn entry_sub(entry: &AtomicU64, dec: u64) {
    loop {
        let old = load_sync(entry);
        if entry
            .compare_exchange_weak(old, old.wrapping_sub(dec), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Force an entry to zero, warning if it held anything.
///
/// Used when a freshly mapped window is initialized; a non-zero value there
/// means a stale refcount survived from a previous mapping of the range.
fn entry_clear(entry: &AtomicU64) {
    let old = load_sync(entry);
    if old == 0 {
        return;
    }
    tracing::warn!("clearing non-zero entry {:#x}", old);
    loop {
        let old = load_sync(entry);
        if entry
            .compare_exchange_weak(old, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Map the entry window covering `[data_addr, data_addr + data_size)`.
///
/// The window is an anonymous mapping at a file offset encoding the table
/// page number, which rustix's anonymous mmap cannot express; this is the
/// one call that goes through libc directly.
#[cfg(feature = "uxpt")]
pub(crate) fn map_window(data_addr: u64, data_size: usize) -> Result<(NonNull<AtomicU64>, usize)> {
    let len = page::table_window_len(data_addr, data_size).ok_or(Error::OutOfRange {
        addr: data_addr,
        len: data_size,
    })?;
    let offset = page::table_window_offset(data_addr);
    // SAFETY: fresh kernel-chosen mapping; no existing memory is touched.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | crate::probe::MAP_USEREXPTE as libc::c_int,
            -1,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(Error::MapTable(rustix::io::Errno::from_raw_os_error(errno)));
    }
    let ptr = NonNull::new(ptr.cast::<AtomicU64>()).ok_or(Error::MapTable(
        rustix::io::Errno::INVAL,
    ))?;
    Ok((ptr, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_refcount_step_clears_present_bit() {
        // Refcounts never touch the kernel's bit.
        assert_eq!(REFCNT_ONE & PRESENT_MASK, 0);
        assert_eq!(UNDER_RECLAIM, u64::MAX - 1);
    }

    #[test]
    fn test_entry_add_sub_balance() {
        let entry = AtomicU64::new(0);
        for _ in 0..5 {
            entry_add(&entry, REFCNT_ONE);
        }
        assert_eq!(entry.load(Ordering::Acquire), 5 * REFCNT_ONE);
        for _ in 0..5 {
            entry_sub(&entry, REFCNT_ONE);
        }
        assert_eq!(entry.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_entry_add_keeps_present_bit() {
        let entry = AtomicU64::new(1); // present, refcount 0
        entry_add(&entry, REFCNT_ONE);
        assert_eq!(entry.load(Ordering::Acquire), REFCNT_ONE | 1);
        entry_sub(&entry, REFCNT_ONE);
        assert_eq!(entry.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_entry_add_aborts_on_overflow() {
        let entry = AtomicU64::new(u64::MAX);
        entry_add(&entry, REFCNT_ONE);
        assert_eq!(entry.load(Ordering::Acquire), u64::MAX);
    }

    #[test]
    fn test_entry_add_waits_out_reclaim() {
        let entry = Arc::new(AtomicU64::new(UNDER_RECLAIM));
        let adder = {
            let entry = Arc::clone(&entry);
            std::thread::spawn(move || entry_add(&entry, REFCNT_ONE))
        };
        // The increment must not land while the sentinel is up.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(entry.load(Ordering::Acquire), UNDER_RECLAIM);

        // Kernel finishes reclaim: entry drops to "absent, refcount 0".
        entry.store(0, Ordering::Release);
        adder.join().unwrap();
        assert_eq!(entry.load(Ordering::Acquire), REFCNT_ONE);
    }

    #[test]
    fn test_entry_clear() {
        let entry = AtomicU64::new(3 * REFCNT_ONE | 1);
        entry_clear(&entry);
        assert_eq!(entry.load(Ordering::Acquire), 0);
        entry_clear(&entry); // already zero: no-op
        assert_eq!(entry.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_concurrent_add_sub() {
        let entry = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = Arc::clone(&entry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        entry_add(&entry, REFCNT_ONE);
                        entry_sub(&entry, REFCNT_ONE);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entry.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_table_without_support_is_noop() {
        // On kernels without the extension (any mainline Linux) the table
        // carries no window and every operation degrades.
        let mut table = UxPageTable::init(0x10_0000, 4 * page::page_size()).unwrap();
        if table.entries.is_some() {
            // Running on a supporting kernel; the no-op path is moot there.
            table.deinit().unwrap();
            return;
        }
        let addr = 0x10_0000;
        assert!(table.get(addr, 100).is_ok());
        assert!(table.put(addr, 100).is_ok());
        assert!(table.clear(addr, 100).is_ok());
        assert!(table.is_present(addr, 4 * page::page_size()));
        assert!(table.deinit().is_ok());
        assert!(table.deinit().is_ok()); // idempotent
    }
}
