//! # purgemem
//!
//! Purgeable memory for userspace: anonymous regions whose physical pages
//! the kernel may reclaim under memory pressure, rebuilt on demand from a
//! caller-supplied chain of build steps.
//!
//! Large regeneratable caches (decoded images, parsed blobs) usually pin
//! RAM for content the application could recompute. On kernels with the
//! purgeable-memory extension this crate maps such content reclaim-eligible
//! and tracks it through a per-page presence/refcount table shared with the
//! kernel; accesses pin the pages, detect a purge, and replay the rebuild
//! chain before handing out a guard. On any other kernel the same API runs
//! in fallback mode: content builds once and is never reclaimed.
//!
//! ## Features
//!
//! - **Lazy rebuild**: content is the replay of an ordered step chain over
//!   a zeroed buffer; byte-identical after every purge
//! - **Race-free access**: reader/writer lock with a purged?-rebuild-retry
//!   loop; RAII guards bound every access window
//! - **Lock-free page pinning**: 64-bit CAS on table entries shared with
//!   the kernel, yielding while a reclaim is in flight
//! - **Graceful degradation**: one probe at first use; unsupported kernels
//!   degrade to plain private mappings
//!
//! ## Quick Start
//!
//! ```rust
//! use purgemem::PurgeableMem;
//!
//! # fn main() -> purgemem::Result<()> {
//! // Content is defined by its build step, not by what you wrote last.
//! let cache = PurgeableMem::new(64 * 1024, |data: &mut [u8]| {
//!     data.fill(0xAB);
//!     true
//! })?;
//!
//! let content = cache.begin_read()?; // pinned + built
//! assert_eq!(content[0], 0xAB);
//! drop(content); // unpinned; reclaim-eligible again
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod builder;
pub mod error;
pub mod manager;
pub mod page;
pub mod probe;
pub mod purgeable;
pub mod uxpt;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::{BuildStep, BuilderChain};
    pub use crate::error::{Error, Result};
    pub use crate::manager::ResourceManager;
    pub use crate::purgeable::{PurgeableMem, ReadGuard, WriteGuard};
}

pub use error::{Error, Result};
pub use purgeable::PurgeableMem;
