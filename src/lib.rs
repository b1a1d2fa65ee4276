//! # mmap-alloc: file-backed typed sequences
//!
//! This crate lets a typed sequence draw its storage from a memory-mapped file
//! instead of the heap, so large binary files can be read as arrays of
//! fixed-size records without copying them into RAM.
//!
//! ## Features
//!
//! - **Zero-copy access**: file bytes are exposed directly as `&[T]` for any [`bytemuck::Pod`] `T`
//! - **Shared mappings**: a process-wide, reference-counted pool deduplicates
//!   requests for the same file region
//! - **Whole-file reuse**: one whole-file mapping serves every sub-range request
//! - **Private mappings**: opt out of sharing per allocator
//! - **Thread-safe pool**: acquire/release are serialized per key
//!
//! ## Quick Start
//!
//! ```no_run
//! use mmap_alloc::{map_file, AccessMode};
//!
//! // View the first 1024 native-endian u32 records of a file
//! let records = map_file::<u32, _>("data.bin", AccessMode::ReadOnly, 0, 1024)?;
//! println!("first record: {}", records[0]);
//! # Ok::<(), mmap_alloc::MmapAllocError>(())
//! ```
//!
//! ## Modules
//!
//! - [`errors`]: Error types for all operations
//! - [`utils`]: Page size and alignment helpers
//! - [`mode`]: Access modes and mapping flags
//! - [`region`]: `MappedRegion`, ownership of one OS mapping
//! - [`pool`]: `FileMappingPool`, the shared mapping registry
//! - [`allocator`]: `MappingAllocator` and its storage providers
//! - [`sequence`]: `MappedSequence`, the fixed-capacity container
//! - [`manager`]: High-level convenience functions
//! - [`verbosity`]: Global allocation tracing toggle

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(missing_docs)]

pub mod errors;
pub mod utils;
pub mod mode;
pub mod region;
pub mod pool;
pub mod allocator;
pub mod sequence;
pub mod manager;
pub mod verbosity;

pub use allocator::{MappingAllocator, MappingAllocatorBuilder, StorageProvider};
pub use errors::MmapAllocError;
pub use mode::{AccessMode, MappingFlags};
pub use pool::{FileMappingPool, LeakedMapping, Lease, MappingKey};
pub use region::MappedRegion;
pub use sequence::MappedSequence;
pub use manager::{
    heap_sequence, map_file, map_file_with_flags, map_private, map_whole_file,
    sequence_from_slice, shutdown_global_pool,
};
pub use verbosity::{set_verbosity, verbosity};
