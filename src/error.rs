//! Error types for purgemem.

use thiserror::Error;

/// Result type alias using purgemem's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for purgeable-memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested size was zero.
    #[error("size must be greater than 0")]
    ZeroSize,

    /// Requested size cannot be rounded to a page boundary.
    #[error("requested size {0} cannot be page-aligned")]
    SizeOverflow(usize),

    /// Mapping the data region failed.
    #[error("mapping data region failed: {0}")]
    MapData(rustix::io::Errno),

    /// Unmapping the data region failed.
    #[error("unmapping data region failed: {0}")]
    UnmapData(rustix::io::Errno),

    /// Mapping the page-table window failed.
    #[error("mapping page-table window failed: {0}")]
    MapTable(rustix::io::Errno),

    /// Unmapping the page-table window failed.
    #[error("unmapping page-table window failed: {0}")]
    UnmapTable(rustix::io::Errno),

    /// An address range fell outside the tracked data region.
    #[error("range {addr:#x}+{len} outside the tracked data region")]
    OutOfRange {
        /// Start address of the offending range.
        addr: u64,
        /// Length of the offending range in bytes.
        len: usize,
    },

    /// A step of the rebuild pipeline reported failure.
    #[error("rebuild failed at step {step}")]
    BuildFailed {
        /// Index of the failing step in the chain.
        step: usize,
    },

    /// The object's lock was poisoned by a panicking holder.
    #[error("lock poisoned")]
    LockPoisoned,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
