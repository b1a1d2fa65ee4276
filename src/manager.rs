//! High-level API for mapping files as typed sequences.
//!
//! Provides convenience functions that wrap allocator configuration and
//! [`MappedSequence::map`].

use std::path::PathBuf;

use bytemuck::Pod;

use crate::allocator::MappingAllocator;
use crate::errors::Result;
use crate::mode::{AccessMode, MappingFlags};
use crate::pool::{FileMappingPool, LeakedMapping};
use crate::sequence::MappedSequence;

/// Map `count` elements of `path` starting at byte `offset` through the process-wide pool.
///
/// # Errors
///
/// Returns errors from [`MappedSequence::map`].
pub fn map_file<T: Pod, P: Into<PathBuf>>(
    path: P,
    mode: AccessMode,
    offset: u64,
    count: usize,
) -> Result<MappedSequence<T>> {
    map_file_with_flags(path, mode, offset, count, MappingFlags::NONE)
}

/// Like [`map_file`] with explicit flags.
///
/// # Errors
///
/// Returns errors from [`MappedSequence::map`].
pub fn map_file_with_flags<T: Pod, P: Into<PathBuf>>(
    path: P,
    mode: AccessMode,
    offset: u64,
    count: usize,
    flags: MappingFlags,
) -> Result<MappedSequence<T>> {
    MappedSequence::with_len(MappingAllocator::new(path, mode, offset, flags), count)
}

/// Map `count` elements at `offset`, backed by a pooled mapping of the whole file
/// that later sub-range requests can share.
///
/// # Errors
///
/// Returns errors from [`MappedSequence::map`].
pub fn map_whole_file<T: Pod, P: Into<PathBuf>>(
    path: P,
    mode: AccessMode,
    offset: u64,
    count: usize,
) -> Result<MappedSequence<T>> {
    map_file_with_flags(path, mode, offset, count, MappingFlags::MAP_WHOLE_FILE)
}

/// Map `count` elements at `offset` with a private mapping that bypasses the pool.
///
/// # Errors
///
/// Returns errors from [`MappedSequence::map`].
pub fn map_private<T: Pod, P: Into<PathBuf>>(
    path: P,
    mode: AccessMode,
    offset: u64,
    count: usize,
) -> Result<MappedSequence<T>> {
    map_file_with_flags(path, mode, offset, count, MappingFlags::BYPASS_POOL)
}

/// Zero-filled heap-backed sequence of `count` elements.
///
/// # Errors
///
/// Returns `MmapAllocError::Unsupported` if `count` overflows the address space.
pub fn heap_sequence<T: Pod>(count: usize) -> Result<MappedSequence<T>> {
    MappedSequence::with_len(MappingAllocator::heap(), count)
}

/// Heap-backed sequence holding a copy of `values`.
///
/// # Errors
///
/// Returns `MmapAllocError::Unsupported` if the allocation size overflows.
pub fn sequence_from_slice<T: Pod>(values: &[T]) -> Result<MappedSequence<T>> {
    let mut seq = heap_sequence(values.len())?;
    seq.as_mut_slice()?.copy_from_slice(values);
    Ok(seq)
}

/// Run the leak check on the process-wide pool, logging and returning survivors.
pub fn shutdown_global_pool() -> Vec<LeakedMapping> {
    FileMappingPool::global().shutdown()
}
