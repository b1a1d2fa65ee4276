//! Ownership of a single OS-level file mapping.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    ptr::NonNull,
};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::errors::{MmapAllocError, Result};
use crate::mode::AccessMode;
use crate::utils::{align_down, align_up, ensure_in_bounds, page_size, to_u64, to_usize};

enum MapVariant {
    Ro(Mmap),
    Rw(MmapMut),
    /// Private mapping; writes never reach the file.
    Cow(MmapMut),
}

/// One live file mapping together with the descriptor that backs it.
///
/// The OS mapping starts at the requested offset rounded down to a page
/// boundary. [`as_ptr`](Self::as_ptr) points at the requested offset itself, and
/// [`len`](Self::len) bytes are addressable from there.
///
/// Dropping the region (or calling [`close`](Self::close)) unmaps it and closes
/// the descriptor. Because `close` consumes the handle, a region can never be
/// torn down twice.
pub struct MappedRegion {
    path: PathBuf,
    mode: AccessMode,
    offset: u64,
    len: usize,
    mapped_len: usize,
    base: NonNull<u8>,
    map: MapVariant,
    _file: File,
}

// SAFETY: `base` points into the mapping owned by `map`, which lives exactly as
// long as the region. The region never dereferences it; callers that do are
// responsible for synchronizing access to the bytes.
unsafe impl Send for MappedRegion {}
// SAFETY: see above; shared references only expose the pointer value.
unsafe impl Sync for MappedRegion {}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("mapped_len", &self.mapped_len)
            .field("os_len", &self.os_len())
            .field("base", &self.base)
            .finish()
    }
}

fn mapping_error(path: &Path, source: io::Error) -> MmapAllocError {
    MmapAllocError::Mapping {
        path: path.to_path_buf(),
        source,
    }
}

fn zero_length(path: &Path) -> MmapAllocError {
    mapping_error(path, io::Error::from_raw_os_error(libc::EINVAL))
}

fn open_file(path: &Path, mode: AccessMode) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    match mode {
        AccessMode::DefaultHeap => {
            return Err(MmapAllocError::InvalidMode("heap mode has no file to map"));
        }
        AccessMode::ReadWrite => {
            opts.write(true).create(true);
        }
        AccessMode::ReadOnly | AccessMode::CopyOnWrite => {}
    }
    opts.open(path).map_err(|e| mapping_error(path, e))
}

impl MappedRegion {
    /// Map `len` bytes of `path` starting at byte `offset`.
    ///
    /// Read-write mappings create the file when it is missing and extend it
    /// when it is shorter than `offset + len`. Read-only and copy-on-write
    /// mappings require the range to lie within the file.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::InvalidMode` for `AccessMode::DefaultHeap`.
    /// Returns `MmapAllocError::Mapping` if `len` is zero or the file cannot be opened or mapped.
    /// Returns `MmapAllocError::OutOfBounds` if a read-only or copy-on-write range exceeds the file.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode, offset: u64, len: usize) -> Result<Self> {
        let path = path.as_ref();
        if len == 0 {
            return Err(zero_length(path));
        }
        let file = open_file(path, mode)?;
        let len_u64 = to_u64(len)?;
        let end = offset
            .checked_add(len_u64)
            .ok_or(MmapAllocError::OutOfBounds { offset, len: len_u64, total: u64::MAX })?;
        let file_len = file.metadata().map_err(|e| mapping_error(path, e))?.len();
        if mode == AccessMode::ReadWrite {
            if file_len < end {
                file.set_len(end).map_err(|e| mapping_error(path, e))?;
            }
        } else {
            ensure_in_bounds(offset, len_u64, file_len)?;
        }
        Self::map(path, file, mode, offset, len)
    }

    /// Map the entire contents of `path`.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::Mapping` if the file is empty, missing, or cannot be mapped.
    pub fn open_whole<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        let file = open_file(path, mode)?;
        let file_len = file.metadata().map_err(|e| mapping_error(path, e))?.len();
        if file_len == 0 {
            return Err(zero_length(path));
        }
        let len = to_usize(file_len)?;
        Self::map(path, file, mode, 0, len)
    }

    fn map(path: &Path, file: File, mode: AccessMode, offset: u64, len: usize) -> Result<Self> {
        let page = page_size();
        let map_offset = align_down(offset, to_u64(page)?);
        let delta = to_usize(offset - map_offset)?;
        let map_len = delta
            .checked_add(len)
            .ok_or(MmapAllocError::Unsupported("mapping length overflows usize"))?;
        let mapped_len = to_usize(align_up(to_u64(map_len)?, to_u64(page)?))?;

        let mut opts = MmapOptions::new();
        opts.offset(map_offset).len(map_len);
        // SAFETY: the file stays open for the lifetime of the mapping and the
        // range was validated (or the file extended) by the caller.
        let (map, base) = unsafe {
            match mode {
                AccessMode::ReadOnly => {
                    let m = opts.map(&file).map_err(|e| mapping_error(path, e))?;
                    let base = m.as_ptr().cast_mut();
                    (MapVariant::Ro(m), base)
                }
                AccessMode::ReadWrite => {
                    let mut m = opts.map_mut(&file).map_err(|e| mapping_error(path, e))?;
                    let base = m.as_mut_ptr();
                    (MapVariant::Rw(m), base)
                }
                AccessMode::CopyOnWrite => {
                    let mut m = opts.map_copy(&file).map_err(|e| mapping_error(path, e))?;
                    let base = m.as_mut_ptr();
                    (MapVariant::Cow(m), base)
                }
                AccessMode::DefaultHeap => {
                    return Err(MmapAllocError::InvalidMode("heap mode has no file to map"));
                }
            }
        };
        // SAFETY: delta < page size and the mapping spans delta + len > delta bytes.
        let base = unsafe { base.add(delta) };
        let base = NonNull::new(base)
            .ok_or_else(|| mapping_error(path, io::Error::from_raw_os_error(libc::ENOMEM)))?;

        log::debug!(
            "mapped {} ({:?}) offset={} len={} mapped_len={} at {:p}",
            path.display(),
            mode,
            offset,
            len,
            mapped_len,
            base
        );
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            offset,
            len,
            mapped_len,
            base,
            map,
            _file: file,
        })
    }

    /// Unmap the region and close its descriptor.
    pub fn close(self) {
        drop(self);
    }

    /// Pointer to the first byte at the requested file offset.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.base
    }

    /// Number of bytes addressable from [`as_ptr`](Self::as_ptr).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region addresses no bytes. Never true for a successfully opened region.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Page-aligned size of the underlying OS mapping.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    /// File offset the region starts at.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Access mode the region was opened with.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Path to the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file range [offset, offset+len) lies inside this region.
    #[must_use]
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        let (Ok(len), Ok(own_len)) = (to_u64(len), to_u64(self.len)) else {
            return false;
        };
        offset >= self.offset
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= self.offset + own_len)
    }

    /// Flush `len` bytes starting `start` bytes into the region. No-op unless read-write.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::OutOfBounds` if the range exceeds the region.
    /// Returns `MmapAllocError::FlushFailed` if the OS flush fails.
    pub fn flush_range(&self, start: usize, len: usize) -> Result<()> {
        ensure_in_bounds(to_u64(start)?, to_u64(len)?, to_u64(self.len)?)?;
        match &self.map {
            MapVariant::Ro(_) | MapVariant::Cow(_) => Ok(()),
            MapVariant::Rw(m) => {
                if len == 0 {
                    return Ok(());
                }
                let delta = self.mapped_delta();
                m.flush_range(delta + start, len)
                    .map_err(|e| MmapAllocError::FlushFailed(e.to_string()))
            }
        }
    }

    /// Flush the whole region. No-op unless read-write.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::FlushFailed` if the OS flush fails.
    pub fn flush(&self) -> Result<()> {
        self.flush_range(0, self.len)
    }

    /// Length handed to the OS mapping call, before page rounding.
    fn os_len(&self) -> usize {
        match &self.map {
            MapVariant::Ro(m) => m.len(),
            MapVariant::Rw(m) | MapVariant::Cow(m) => m.len(),
        }
    }

    fn mapped_delta(&self) -> usize {
        let page = page_size() as u64;
        (self.offset % page) as usize
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        log::debug!(
            "unmapping {} ({:?}) offset={} mapped_len={}",
            self.path.display(),
            self.mode,
            self.offset,
            self.mapped_len
        );
    }
}
