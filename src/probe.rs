//! Kernel support probe for purgeable mappings and the page-table window.
//!
//! Purgeable memory is a kernel extension: anonymous mappings tagged
//! [`MAP_PURGEABLE`] may have their physical pages reclaimed under memory
//! pressure, and a companion [`MAP_USEREXPTE`] mapping exposes one 64-bit
//! entry per data page carrying the kernel's present bit and a userspace
//! refcount. Mainline Linux has neither flag, so the probe fails there and
//! every table operation degrades to a no-op: memory is then treated as
//! never purged and content is built exactly once.
//!
//! The probe runs at most once per process, on first use.

#[cfg(feature = "uxpt")]
use crate::page;

/// Tag for an anonymous mapping whose pages the kernel may reclaim.
///
/// Kernel-extension uapi value; not exported by any libc crate.
pub(crate) const MAP_PURGEABLE: u32 = 0x0400_0000;

/// Tag mapping the page-table window covering a purgeable data region.
pub(crate) const MAP_USEREXPTE: u32 = 0x0800_0000;

/// Whether the running kernel supports purgeable mappings and their
/// page-table window.
///
/// Computed once on first call; later calls return the cached result.
#[cfg(feature = "uxpt")]
pub fn uxpt_supported() -> bool {
    static SUPPORTED: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *SUPPORTED.get_or_init(probe)
}

/// Whether the running kernel supports purgeable mappings and their
/// page-table window. Always `false` when the `uxpt` feature is off.
#[cfg(not(feature = "uxpt"))]
pub fn uxpt_supported() -> bool {
    false
}

/// Map one purgeable page, then the table window covering it; unmap both.
/// Support means both mappings succeeded.
#[cfg(feature = "uxpt")]
fn probe() -> bool {
    use rustix::mm::{MapFlags, ProtFlags};

    let len = page::page_size();
    // SAFETY: fresh kernel-chosen mapping; no existing memory is touched.
    let data = match unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::from_bits_retain(MAP_PURGEABLE),
        )
    } {
        Ok(ptr) => ptr,
        Err(err) => {
            tracing::debug!("purgeable mappings unavailable: {}", err);
            return false;
        }
    };

    let supported = match crate::uxpt::map_window(data as u64, len) {
        Ok((window, window_len)) => {
            // SAFETY: window was mapped just above with this exact length.
            if let Err(err) = unsafe { rustix::mm::munmap(window.as_ptr().cast(), window_len) } {
                tracing::error!("unmapping probe window failed: {}", err);
            }
            true
        }
        Err(err) => {
            tracing::debug!("page-table window unavailable: {}", err);
            false
        }
    };

    // SAFETY: data was mapped just above with this exact length.
    if let Err(err) = unsafe { rustix::mm::munmap(data, len) } {
        tracing::error!("unmapping probe page failed: {}", err);
    }

    tracing::debug!("purgeable memory support: {}", supported);
    supported
}
