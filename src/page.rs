//! Page arithmetic shared by the data mapping and the page-table window.
//!
//! The table window packs one 8-byte entry per data page, so a virtual
//! address splits three ways:
//!
//! ```text
//! |          virtual page number           |                           |
//! |----------------------------------------| vaddr offset in virt page |
//! | table page number | entry offset       |                           |
//! ---------------------------------------------------------------------
//! |                   | PAGE_SHIFT - ENTRY_SHIFT |     PAGE_SHIFT      |
//! ```

use std::sync::OnceLock;

/// log2 of one table entry's size (entries are 8 bytes).
pub(crate) const ENTRY_SHIFT: u32 = 3;

/// Cached system page size.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(rustix::param::page_size)
}

/// log2 of the system page size.
pub(crate) fn page_shift() -> u32 {
    page_size().trailing_zeros()
}

/// Round `val` up to the next multiple of `align` (a power of two).
///
/// Returns `None` if the rounded value would not fit in a `usize`.
pub fn round_up(val: usize, align: usize) -> Option<usize> {
    Some(val.checked_add(align - 1)? & !(align - 1))
}

/// Round `addr` up to the next multiple of `align` (a power of two).
pub(crate) fn round_up_addr(addr: u64, align: u64) -> Option<u64> {
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Round `addr` down to a multiple of `align` (a power of two).
pub fn round_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Virtual page number of `addr`.
pub(crate) fn virt_page_no(addr: u64) -> u64 {
    addr >> page_shift()
}

/// Number of the table page holding the entry for `addr`.
///
/// One table page covers `1 << (PAGE_SHIFT - ENTRY_SHIFT)` data pages.
pub(crate) fn table_page_no(addr: u64) -> u64 {
    virt_page_no(addr) >> (page_shift() - ENTRY_SHIFT)
}

/// Entry index of `addr` inside its table page.
pub(crate) fn entry_offset(addr: u64) -> u64 {
    virt_page_no(addr) & ((1u64 << (page_shift() - ENTRY_SHIFT)) - 1)
}

/// Byte offset of the table window for a region starting at `addr`.
pub(crate) fn table_window_offset(addr: u64) -> u64 {
    table_page_no(addr) * page_size() as u64
}

/// Byte length of the table window covering `[addr, addr + len)`.
///
/// `None` when the range itself is not representable.
pub(crate) fn table_window_len(addr: u64, len: usize) -> Option<usize> {
    let end = addr.checked_add(len as u64)?;
    if end == 0 {
        return None;
    }
    let first = table_page_no(addr);
    let last = table_page_no(end - 1);
    let pages = last.checked_sub(first)?.checked_add(1)?;
    usize::try_from(pages).ok()?.checked_mul(page_size())
}
