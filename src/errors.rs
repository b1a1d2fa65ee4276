//! Crate-specific error types for mmap-alloc.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::pool::MappingKey;

/// Result alias for mmap-alloc operations.
pub type Result<T> = std::result::Result<T, MmapAllocError>;

/// Error type covering file mapping, allocation state, and pool consistency issues.
#[derive(Debug, Error)]
pub enum MmapAllocError {
    /// Wrapper for `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Opening the file or issuing the OS mapping call failed.
    #[error("failed to map {}: {source}", path.display())]
    Mapping {
        /// File that was being mapped.
        path: PathBuf,
        /// Underlying OS error; `raw_os_error()` carries the errno.
        #[source]
        source: io::Error,
    },

    /// Error returned when attempting an operation in an incompatible mode.
    #[error("invalid access mode: {0}")]
    InvalidMode(&'static str),

    /// Error when a requested offset/length pair is out of bounds.
    #[error("range out of bounds: offset={offset}, len={len}, total={total}")]
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Total size of the file.
        total: u64,
    },

    /// Allocate or map called while a live mapping is already held.
    #[error("already mapped: deallocate before allocating again")]
    AlreadyMapped,

    /// Growth, remapping, or another operation this layer does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The file offset cannot hold elements of the requested alignment.
    #[error("offset {offset} is not aligned to {align} bytes")]
    Misaligned {
        /// Configured file offset.
        offset: u64,
        /// Required element alignment.
        align: usize,
    },

    /// Deallocate called with a pointer or count that does not match the live allocation.
    #[error("invalid release: {0}")]
    InvalidRelease(&'static str),

    /// Release called for a key the pool does not hold. Indicates a caller bug.
    #[error("mapping pool inconsistent: no live entry for {key}")]
    PoolConsistency {
        /// Key passed to the offending release.
        key: MappingKey,
    },

    /// Error when a flush operation fails.
    #[error("flush failed: {0}")]
    FlushFailed(String),
}

impl MmapAllocError {
    /// Whether the error signals a broken invariant rather than a recoverable condition.
    ///
    /// Callers should stop using the pool after a fatal error instead of retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PoolConsistency { .. })
    }

    /// OS error code behind a mapping or I/O failure, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io(e) | Self::Mapping { source: e, .. } => e.raw_os_error(),
            _ => None,
        }
    }
}
