//! Storage allocation for file-backed sequences.
//!
//! A [`MappingAllocator`] is configured once with a path, offset, access mode
//! and flags. That configuration selects a [`StorageProvider`]:
//!
//! - [`HeapStorage`] for [`AccessMode::DefaultHeap`],
//! - [`PooledStorage`] for mapped modes, sharing regions through a [`FileMappingPool`],
//! - [`PrivateStorage`] when [`MappingFlags::BYPASS_POOL`] is set.
//!
//! Each provider holds at most one live allocation.

use std::{
    alloc::{self, Layout},
    fmt,
    io,
    marker::PhantomData,
    mem,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::Arc,
};

use crate::errors::{MmapAllocError, Result};
use crate::mode::{AccessMode, MappingFlags};
use crate::pool::{FileMappingPool, Lease, MappingKey};
use crate::region::MappedRegion;
use crate::utils::{to_u64, to_usize};
use crate::verbosity;

/// A source of raw storage, holding at most one live block at a time.
pub trait StorageProvider: Send {
    /// Obtain a block for `layout`.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::AlreadyMapped` if a block is live, or the
    /// provider's mapping or allocation error.
    fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>>;

    /// Return the block previously obtained for `layout` at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::InvalidRelease` if `ptr` is not the live block.
    fn release(&mut self, ptr: NonNull<u8>, layout: Layout) -> Result<()>;

    /// Return the live block, if any, regardless of its address.
    ///
    /// # Errors
    ///
    /// Returns errors from the underlying release.
    fn release_live(&mut self) -> Result<()>;

    /// Whether a block is currently live.
    fn is_live(&self) -> bool;

    /// Whether the live block is reachable only through this provider.
    fn is_exclusive(&self) -> bool;

    /// Persist writes to the live block where the storage has a backing file.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::FlushFailed` if the flush fails.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Zero-filled memory from the global allocator.
#[derive(Debug, Default)]
pub struct HeapStorage {
    live: Option<(NonNull<u8>, Layout)>,
}

// SAFETY: the block is owned by this provider and handed out to a single owner.
unsafe impl Send for HeapStorage {}

impl StorageProvider for HeapStorage {
    fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if self.live.is_some() {
            return Err(MmapAllocError::AlreadyMapped);
        }
        let ptr = if layout.size() == 0 {
            // Zero-sized blocks are never dereferenced; any aligned address works.
            NonNull::new(layout.align() as *mut u8)
        } else {
            // SAFETY: layout has a non-zero size.
            NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
        };
        let ptr = ptr.ok_or_else(|| MmapAllocError::Io(io::ErrorKind::OutOfMemory.into()))?;
        self.live = Some((ptr, layout));
        Ok(ptr)
    }

    fn release(&mut self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        match self.live {
            None => Err(MmapAllocError::InvalidRelease("no live block")),
            Some(live) if live != (ptr, layout) => {
                Err(MmapAllocError::InvalidRelease("pointer or size does not match the live block"))
            }
            Some(_) => self.release_live(),
        }
    }

    fn release_live(&mut self) -> Result<()> {
        if let Some((ptr, layout)) = self.live.take() {
            if layout.size() != 0 {
                // SAFETY: ptr was returned by alloc_zeroed with this layout.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live.is_some()
    }

    fn is_exclusive(&self) -> bool {
        true
    }
}

impl Drop for HeapStorage {
    fn drop(&mut self) {
        let _ = self.release_live();
    }
}

/// Mapped storage shared through a [`FileMappingPool`].
pub struct PooledStorage {
    pool: Arc<FileMappingPool>,
    key: MappingKey,
    flags: MappingFlags,
    lease: Option<Lease>,
}

impl fmt::Debug for PooledStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStorage")
            .field("key", &self.key)
            .field("flags", &self.flags)
            .field("lease", &self.lease)
            .finish()
    }
}

impl PooledStorage {
    /// Provider acquiring `key` from `pool` with `flags`.
    #[must_use]
    pub fn new(pool: Arc<FileMappingPool>, key: MappingKey, flags: MappingFlags) -> Self {
        Self {
            pool,
            key,
            flags,
            lease: None,
        }
    }

    /// The live lease, if any.
    #[must_use]
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }
}

impl StorageProvider for PooledStorage {
    fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if self.lease.is_some() {
            return Err(MmapAllocError::AlreadyMapped);
        }
        let lease = self.pool.acquire(&self.key, layout.size(), self.flags)?;
        let ptr = lease.as_ptr();
        self.lease = Some(lease);
        Ok(ptr)
    }

    fn release(&mut self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        let matches = match &self.lease {
            Some(lease) => lease.as_ptr() == ptr && lease.len() == layout.size(),
            None => return Err(MmapAllocError::InvalidRelease("no live lease")),
        };
        if !matches {
            return Err(MmapAllocError::InvalidRelease("pointer or size does not match the live lease"));
        }
        self.release_live()
    }

    fn release_live(&mut self) -> Result<()> {
        if let Some(lease) = &self.lease {
            self.pool.release(lease.key(), lease.len())?;
            self.lease = None;
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.lease.is_some()
    }

    fn is_exclusive(&self) -> bool {
        false
    }

    fn flush(&self) -> Result<()> {
        match &self.lease {
            Some(lease) => self.pool.flush(lease),
            None => Ok(()),
        }
    }
}

impl Drop for PooledStorage {
    fn drop(&mut self) {
        if let Err(e) = self.release_live() {
            log::error!("failed to release pooled mapping {}: {e}", self.key);
        }
    }
}

/// A mapping owned by one allocator and never registered in a pool.
#[derive(Debug)]
pub struct PrivateStorage {
    path: PathBuf,
    mode: AccessMode,
    offset: u64,
    whole_file: bool,
    live: Option<(MappedRegion, NonNull<u8>)>,
}

// SAFETY: the pointer refers into the region held alongside it.
unsafe impl Send for PrivateStorage {}

impl PrivateStorage {
    /// Provider mapping `path` in `mode` at `offset`. `whole_file` maps the entire file.
    pub fn new<P: Into<PathBuf>>(path: P, mode: AccessMode, offset: u64, whole_file: bool) -> Self {
        Self {
            path: path.into(),
            mode,
            offset,
            whole_file,
            live: None,
        }
    }

    /// The live region, if any.
    #[must_use]
    pub fn region(&self) -> Option<&MappedRegion> {
        self.live.as_ref().map(|(region, _)| region)
    }

    fn open(&self, len: usize) -> Result<(MappedRegion, NonNull<u8>)> {
        if !self.whole_file {
            let region = MappedRegion::open(&self.path, self.mode, self.offset, len)?;
            let ptr = region.as_ptr();
            return Ok((region, ptr));
        }
        let region = MappedRegion::open_whole(&self.path, self.mode)?;
        if !region.covers(self.offset, len) {
            return Err(MmapAllocError::OutOfBounds {
                offset: self.offset,
                len: to_u64(len)?,
                total: to_u64(region.len())?,
            });
        }
        let delta = to_usize(self.offset)?;
        // SAFETY: `covers` guarantees offset + len lies within the mapping.
        let ptr = unsafe { NonNull::new_unchecked(region.as_ptr().as_ptr().add(delta)) };
        Ok((region, ptr))
    }
}

impl StorageProvider for PrivateStorage {
    fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if self.live.is_some() {
            return Err(MmapAllocError::AlreadyMapped);
        }
        let (region, ptr) = self.open(layout.size())?;
        self.live = Some((region, ptr));
        Ok(ptr)
    }

    fn release(&mut self, ptr: NonNull<u8>, _layout: Layout) -> Result<()> {
        match self.live.as_ref().map(|(_, live)| *live) {
            None => Err(MmapAllocError::InvalidRelease("no private mapping")),
            Some(live) if live != ptr => {
                Err(MmapAllocError::InvalidRelease("pointer does not match the private mapping"))
            }
            Some(_) => self.release_live(),
        }
    }

    fn release_live(&mut self) -> Result<()> {
        if let Some((region, _)) = self.live.take() {
            region.close();
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live.is_some()
    }

    fn is_exclusive(&self) -> bool {
        true
    }

    fn flush(&self) -> Result<()> {
        match &self.live {
            Some((region, ptr)) => {
                let start = ptr.as_ptr() as usize - region.as_ptr().as_ptr() as usize;
                region.flush_range(start, region.len() - start)
            }
            None => Ok(()),
        }
    }
}

/// Configuration shared by an allocator and its clones.
#[derive(Debug, Clone, Default)]
pub struct MappingConfig {
    path: PathBuf,
    mode: AccessMode,
    offset: u64,
    flags: MappingFlags,
    pool: Option<Arc<FileMappingPool>>,
}

impl MappingConfig {
    /// File to map.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Access mode.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Byte offset into the file.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Mapping flags.
    #[must_use]
    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    fn provider(&self) -> Box<dyn StorageProvider> {
        if !self.mode.is_mapped() {
            return Box::new(HeapStorage::default());
        }
        let whole_file = self.flags.contains(MappingFlags::MAP_WHOLE_FILE);
        if self.flags.contains(MappingFlags::BYPASS_POOL) {
            return Box::new(PrivateStorage::new(self.path.clone(), self.mode, self.offset, whole_file));
        }
        let pool = self.pool.clone().unwrap_or_else(FileMappingPool::global);
        let key = MappingKey::new(self.path.clone(), self.mode, self.offset);
        Box::new(PooledStorage::new(pool, key, self.flags))
    }
}

/// Builder for [`MappingAllocator`].
#[derive(Debug, Clone)]
pub struct MappingAllocatorBuilder<T> {
    config: MappingConfig,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MappingAllocatorBuilder<T> {
    /// Access mode (default `ReadOnly` for builders created with a path).
    #[must_use]
    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Byte offset into the file (default 0).
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.config.offset = offset;
        self
    }

    /// Mapping flags (default none).
    #[must_use]
    pub fn flags(mut self, flags: MappingFlags) -> Self {
        self.config.flags = flags;
        self
    }

    /// Use `pool` instead of the process-wide pool.
    #[must_use]
    pub fn pool(mut self, pool: Arc<FileMappingPool>) -> Self {
        self.config.pool = Some(pool);
        self
    }

    /// Finish configuration.
    #[must_use]
    pub fn build(self) -> MappingAllocator<T> {
        MappingAllocator::from_config(self.config)
    }
}

/// Allocator handing out storage for `T` elements from the heap or a file mapping.
///
/// Holds at most one live allocation. Cloning copies the configuration only;
/// the clone starts with no allocation and acquires independently.
///
/// ```no_run
/// use mmap_alloc::{AccessMode, MappingAllocator};
///
/// let mut alloc = MappingAllocator::<u32>::builder("data.bin")
///     .mode(AccessMode::ReadOnly)
///     .build();
/// let ptr = alloc.allocate(1024)?;
/// alloc.deallocate(ptr, 1024)?;
/// # Ok::<(), mmap_alloc::MmapAllocError>(())
/// ```
pub struct MappingAllocator<T> {
    config: MappingConfig,
    storage: Box<dyn StorageProvider>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for MappingAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingAllocator")
            .field("config", &self.config)
            .field("allocated", &self.storage.is_live())
            .finish()
    }
}

impl<T> Clone for MappingAllocator<T> {
    fn clone(&self) -> Self {
        Self::from_config(self.config.clone())
    }
}

impl<T> Default for MappingAllocator<T> {
    fn default() -> Self {
        Self::heap()
    }
}

impl<T> MappingAllocator<T> {
    /// Allocator for `path` with the given mode, offset and flags, using the process-wide pool.
    pub fn new<P: Into<PathBuf>>(path: P, mode: AccessMode, offset: u64, flags: MappingFlags) -> Self {
        Self::from_config(MappingConfig {
            path: path.into(),
            mode,
            offset,
            flags,
            pool: None,
        })
    }

    /// Allocator backed by ordinary heap memory.
    #[must_use]
    pub fn heap() -> Self {
        Self::from_config(MappingConfig::default())
    }

    /// Start configuring a read-only allocator for `path`.
    pub fn builder<P: Into<PathBuf>>(path: P) -> MappingAllocatorBuilder<T> {
        MappingAllocatorBuilder {
            config: MappingConfig {
                path: path.into(),
                mode: AccessMode::ReadOnly,
                ..MappingConfig::default()
            },
            _marker: PhantomData,
        }
    }

    fn from_config(config: MappingConfig) -> Self {
        let storage = config.provider();
        Self {
            config,
            storage,
            _marker: PhantomData,
        }
    }

    /// Configuration this allocator was built with.
    #[must_use]
    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    /// Access mode.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.config.mode
    }

    /// Whether an allocation is live.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.storage.is_live()
    }

    /// Whether the live storage is reachable only through this allocator.
    ///
    /// Pooled mappings may be shared with other allocators holding the same key.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.storage.is_exclusive()
    }

    /// Obtain storage for `count` elements.
    ///
    /// Heap storage is zero-filled. Mapped storage exposes the file's bytes at
    /// the configured offset.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::AlreadyMapped` if an allocation is already live.
    /// Returns `MmapAllocError::Unsupported` if `count` elements overflow the address space.
    /// Returns `MmapAllocError::Misaligned` if the offset cannot hold `T`.
    /// Returns mapping errors from the pool or region layer; the allocator is left unallocated.
    pub fn allocate(&mut self, count: usize) -> Result<NonNull<T>> {
        if self.storage.is_live() {
            return Err(MmapAllocError::AlreadyMapped);
        }
        let layout = Self::layout(count)?;
        let align = mem::align_of::<T>();
        if self.config.mode.is_mapped() && self.config.offset % to_u64(align)? != 0 {
            return Err(MmapAllocError::Misaligned {
                offset: self.config.offset,
                align,
            });
        }
        if verbosity::tracing() {
            log::info!("Alloc {} bytes.", layout.size());
        }
        let ptr = self.storage.acquire(layout)?;
        if verbosity::tracing() {
            log::info!("pointer = {:p}", ptr);
        }
        Ok(ptr.cast())
    }

    /// Return storage obtained from [`allocate`](Self::allocate) with the same `count`.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::InvalidRelease` if `ptr`/`count` do not match the live allocation.
    /// Returns `MmapAllocError::PoolConsistency` if the pool lost track of the mapping.
    pub fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()> {
        let layout = Self::layout(count)?;
        if verbosity::tracing() {
            log::info!("Dealloc {} bytes ({:p}).", layout.size(), ptr);
        }
        self.storage.release(ptr.cast(), layout)
    }

    /// Persist writes to the backing file. No-op for heap, read-only and copy-on-write storage.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::FlushFailed` if the OS flush fails.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }

    fn layout(count: usize) -> Result<Layout> {
        Layout::array::<T>(count)
            .map_err(|_| MmapAllocError::Unsupported("element count overflows the address space"))
    }
}

impl<T> Drop for MappingAllocator<T> {
    fn drop(&mut self) {
        if self.storage.is_live() {
            log::warn!("allocator for {} dropped with a live allocation", self.config.path.display());
            if let Err(e) = self.storage.release_live() {
                log::error!("failed to release storage on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(bytes).expect("write");
        f.flush().expect("flush");
        f
    }

    #[test]
    fn heap_allocation_is_zeroed_and_released() {
        let mut alloc = MappingAllocator::<u64>::heap();
        let ptr = alloc.allocate(16).expect("allocate");
        // SAFETY: 16 zero-initialized u64s.
        let values = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 16) };
        assert!(values.iter().all(|&v| v == 0));
        assert!(alloc.is_allocated());
        alloc.deallocate(ptr, 16).expect("deallocate");
        assert!(!alloc.is_allocated());
    }

    #[test]
    fn second_allocate_is_rejected() {
        let mut alloc = MappingAllocator::<u8>::heap();
        let ptr = alloc.allocate(4).expect("allocate");
        assert!(matches!(alloc.allocate(4), Err(MmapAllocError::AlreadyMapped)));
        alloc.deallocate(ptr, 4).expect("deallocate");
        let again = alloc.allocate(4).expect("allocate after release");
        alloc.deallocate(again, 4).expect("deallocate");
    }

    #[test]
    fn mismatched_release_is_rejected() {
        let mut alloc = MappingAllocator::<u8>::heap();
        let ptr = alloc.allocate(8).expect("allocate");
        assert!(matches!(alloc.deallocate(ptr, 4), Err(MmapAllocError::InvalidRelease(_))));
        alloc.deallocate(ptr, 8).expect("deallocate");
        assert!(matches!(alloc.deallocate(ptr, 8), Err(MmapAllocError::InvalidRelease(_))));
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let f = file_with(&[0u8; 64]);
        let mut alloc = MappingAllocator::<u32>::builder(f.path())
            .offset(2)
            .pool(Arc::new(FileMappingPool::new()))
            .build();
        assert!(matches!(
            alloc.allocate(4),
            Err(MmapAllocError::Misaligned { offset: 2, align: 4 })
        ));
        assert!(!alloc.is_allocated());
    }

    #[test]
    fn private_whole_file_points_at_offset() {
        let bytes: Vec<u8> = (0..64).collect();
        let f = file_with(&bytes);
        let mut alloc = MappingAllocator::<u8>::new(
            f.path(),
            AccessMode::ReadOnly,
            16,
            MappingFlags::BYPASS_POOL | MappingFlags::MAP_WHOLE_FILE,
        );
        let ptr = alloc.allocate(8).expect("allocate");
        // SAFETY: 8 mapped bytes at offset 16.
        let got = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8) };
        assert_eq!(got, &bytes[16..24]);
        assert!(alloc.is_exclusive());
        alloc.deallocate(ptr, 8).expect("deallocate");
    }

    #[test]
    fn clone_copies_configuration_only() {
        let f = file_with(&[1u8; 32]);
        let pool = Arc::new(FileMappingPool::new());
        let mut a = MappingAllocator::<u8>::builder(f.path()).pool(pool.clone()).build();
        let ptr = a.allocate(32).expect("allocate");
        let mut b = a.clone();
        assert!(!b.is_allocated());
        assert_eq!(b.config().path(), f.path());
        let key = MappingKey::new(f.path(), AccessMode::ReadOnly, 0);
        assert_eq!(pool.refcount(&key), Some(1));
        let ptr_b = b.allocate(32).expect("clone allocates");
        assert_eq!(ptr, ptr_b);
        assert_eq!(pool.refcount(&key), Some(2));
        b.deallocate(ptr_b, 32).expect("deallocate");
        a.deallocate(ptr, 32).expect("deallocate");
        assert!(pool.is_empty());
    }

    #[test]
    fn drop_releases_live_pool_reference() {
        let f = file_with(&[0u8; 128]);
        let pool = Arc::new(FileMappingPool::new());
        {
            let mut alloc = MappingAllocator::<u8>::builder(f.path()).pool(pool.clone()).build();
            alloc.allocate(128).expect("allocate");
            assert_eq!(pool.region_count(), 1);
        }
        assert!(pool.is_empty());
    }
}
