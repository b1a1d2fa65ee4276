//! Fixed-capacity typed sequences over allocator-provided storage.

use std::{fmt, ops::Deref, ptr::NonNull, slice};

use bytemuck::Pod;

use crate::allocator::MappingAllocator;
use crate::errors::{MmapAllocError, Result};

const ERR_GROW: &str = "growing past the mapped capacity requires remapping, which is not implemented";
const ERR_SHARED_WRITE: &str = "storage is a shared pooled mapping; use as_mut_slice_unchecked";

/// A sequence of `T` whose storage comes from a [`MappingAllocator`].
///
/// The sequence starts unmapped. [`map`](Self::map) obtains storage for a
/// fixed number of elements and exposes the existing bytes as `T` values
/// without running any per-element initialization, which is why `T` must be
/// [`Pod`]. The length may shrink and grow back up to the mapped capacity but
/// never beyond it.
///
/// # Examples
///
/// ```no_run
/// use mmap_alloc::{AccessMode, MappedSequence, MappingAllocator, MappingFlags};
///
/// let alloc = MappingAllocator::<i32>::new("data.bin", AccessMode::ReadOnly, 0, MappingFlags::NONE);
/// let mut seq = MappedSequence::new(alloc);
/// seq.map(1024)?;
/// assert_eq!(seq.len(), 1024);
/// let first = seq[0];
/// seq.unmap()?;
/// # let _ = first;
/// # Ok::<(), mmap_alloc::MmapAllocError>(())
/// ```
pub struct MappedSequence<T: Pod> {
    allocator: MappingAllocator<T>,
    storage: Option<(NonNull<T>, usize)>,
    len: usize,
}

// SAFETY: the sequence owns its allocator and storage handle; element access
// follows the usual `&`/`&mut` rules on the sequence itself.
unsafe impl<T: Pod + Send> Send for MappedSequence<T> {}
// SAFETY: shared access only hands out `&[T]`.
unsafe impl<T: Pod + Sync> Sync for MappedSequence<T> {}

impl<T: Pod + fmt::Debug> fmt::Debug for MappedSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedSequence")
            .field("mode", &self.allocator.mode())
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T: Pod> Default for MappedSequence<T> {
    fn default() -> Self {
        Self::new(MappingAllocator::heap())
    }
}

impl<T: Pod> MappedSequence<T> {
    /// Unmapped sequence that will take storage from `allocator`.
    #[must_use]
    pub fn new(allocator: MappingAllocator<T>) -> Self {
        Self {
            allocator,
            storage: None,
            len: 0,
        }
    }

    /// Build a sequence over `allocator` and map `count` elements.
    ///
    /// # Errors
    ///
    /// Returns errors from [`map`](Self::map).
    pub fn with_len(allocator: MappingAllocator<T>, count: usize) -> Result<Self> {
        let mut seq = Self::new(allocator);
        seq.map(count)?;
        Ok(seq)
    }

    /// Obtain storage for `count` elements and expose them.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::AlreadyMapped` if the sequence is mapped; its
    /// state is unchanged. Returns allocator errors otherwise, leaving the
    /// sequence unmapped.
    pub fn map(&mut self, count: usize) -> Result<()> {
        if self.storage.is_some() {
            return Err(MmapAllocError::AlreadyMapped);
        }
        let ptr = self.allocator.allocate(count)?;
        self.storage = Some((ptr, count));
        self.len = count;
        Ok(())
    }

    /// Release the storage. Does nothing when unmapped.
    ///
    /// # Errors
    ///
    /// Returns allocator errors; on error the sequence stays mapped.
    pub fn unmap(&mut self) -> Result<()> {
        let Some((ptr, capacity)) = self.storage else {
            return Ok(());
        };
        self.allocator.deallocate(ptr, capacity)?;
        self.storage = None;
        self.len = 0;
        Ok(())
    }

    /// Whether the sequence currently holds storage.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.storage.is_some()
    }

    /// Number of visible elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no elements are visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the storage holds; zero when unmapped.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.map_or(0, |(_, capacity)| capacity)
    }

    /// Allocator this sequence draws from.
    #[must_use]
    pub fn allocator(&self) -> &MappingAllocator<T> {
        &self.allocator
    }

    /// Visible elements.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match self.storage {
            // SAFETY: storage holds `capacity >= len` initialized elements (zeroed
            // heap memory or mapped file bytes) and lives until unmap.
            Some((ptr, _)) => unsafe { slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Mutable access to the visible elements.
    ///
    /// Available for heap storage and private (`BYPASS_POOL`) mappings, which
    /// no other sequence can reach.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::InvalidMode` for read-only storage and for shared pooled mappings.
    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        self.ensure_exclusive_write()?;
        // SAFETY: storage is writable and reachable only through `self`.
        Ok(unsafe { self.slice_mut() })
    }

    /// Mutable access to the visible elements of any writable storage.
    ///
    /// # Safety
    ///
    /// Pooled mappings are shared by every allocator holding the same key. The
    /// caller must ensure no other sequence reads or writes the overlapping
    /// bytes while the returned slice is alive.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::InvalidMode` for read-only storage.
    pub unsafe fn as_mut_slice_unchecked(&mut self) -> Result<&mut [T]> {
        self.ensure_writable()?;
        Ok(self.slice_mut())
    }

    /// Append `value` within the mapped capacity.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::Unsupported` when the sequence is full.
    /// Returns `MmapAllocError::InvalidMode` for read-only or shared storage.
    pub fn push(&mut self, value: T) -> Result<()> {
        self.ensure_exclusive_write()?;
        if self.len >= self.capacity() {
            return Err(MmapAllocError::Unsupported(ERR_GROW));
        }
        self.len += 1;
        // SAFETY: exclusive writable storage; len <= capacity.
        let elems = unsafe { self.slice_mut() };
        elems[elems.len() - 1] = value;
        Ok(())
    }

    /// Append all of `values` within the mapped capacity. Nothing is written on error.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::Unsupported` if the values do not fit.
    /// Returns `MmapAllocError::InvalidMode` for read-only or shared storage.
    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<()> {
        self.ensure_exclusive_write()?;
        self.reserve(values.len())?;
        let start = self.len;
        self.len += values.len();
        // SAFETY: exclusive writable storage; reserve checked the new len fits.
        let elems = unsafe { self.slice_mut() };
        elems[start..].copy_from_slice(values);
        Ok(())
    }

    /// Resize to `new_len`, filling new slots with `value`.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::Unsupported` if `new_len` exceeds the capacity.
    /// Returns `MmapAllocError::InvalidMode` when growing read-only or shared storage.
    pub fn resize(&mut self, new_len: usize, value: T) -> Result<()> {
        if new_len <= self.len {
            self.truncate(new_len);
            return Ok(());
        }
        self.ensure_exclusive_write()?;
        self.reserve(new_len - self.len)?;
        let start = self.len;
        self.len = new_len;
        // SAFETY: exclusive writable storage; new_len <= capacity.
        let elems = unsafe { self.slice_mut() };
        elems[start..].fill(value);
        Ok(())
    }

    /// Check that `additional` more elements fit in the mapped capacity.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::Unsupported` if they do not; mapped storage never grows.
    pub fn reserve(&self, additional: usize) -> Result<()> {
        match self.len.checked_add(additional) {
            Some(needed) if needed <= self.capacity() => Ok(()),
            _ => Err(MmapAllocError::Unsupported(ERR_GROW)),
        }
    }

    /// Shorten the visible length to `len`. The storage is kept.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Persist writes to the backing file. No-op unless the storage is a read-write mapping.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::FlushFailed` if the OS flush fails.
    pub fn flush(&self) -> Result<()> {
        self.allocator.flush()
    }

    /// Copy the visible elements into a `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.allocator.mode().is_writable() {
            return Err(MmapAllocError::InvalidMode("write access on read-only mapping"));
        }
        Ok(())
    }

    fn ensure_exclusive_write(&self) -> Result<()> {
        self.ensure_writable()?;
        if self.storage.is_some() && !self.allocator.is_exclusive() {
            return Err(MmapAllocError::InvalidMode(ERR_SHARED_WRITE));
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The storage must be writable and not aliased for the returned lifetime.
    unsafe fn slice_mut(&mut self) -> &mut [T] {
        match self.storage {
            Some((ptr, _)) => slice::from_raw_parts_mut(ptr.as_ptr(), self.len),
            None => &mut [],
        }
    }
}

impl<T: Pod> Deref for MappedSequence<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<'a, T: Pod> IntoIterator for &'a MappedSequence<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: Pod> Drop for MappedSequence<T> {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::error!("failed to unmap sequence on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_sequence_lifecycle() {
        let mut seq = MappedSequence::<u32>::default();
        assert!(!seq.is_mapped());
        assert!(seq.is_empty());
        seq.map(4).expect("map");
        assert_eq!(seq.as_slice(), &[0, 0, 0, 0]);
        seq.as_mut_slice().expect("heap is writable").copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(seq.to_vec(), vec![1, 2, 3, 4]);
        seq.unmap().expect("unmap");
        assert!(!seq.is_mapped());
        assert_eq!(seq.capacity(), 0);
    }

    #[test]
    fn growth_is_bounded_by_capacity() {
        let mut seq = MappedSequence::<u16>::with_len(MappingAllocator::heap(), 3).expect("map");
        seq.truncate(1);
        seq.push(7).expect("push within capacity");
        seq.extend_from_slice(&[8]).expect("extend within capacity");
        assert_eq!(seq.as_slice(), &[0, 7, 8]);
        assert!(matches!(seq.push(9), Err(MmapAllocError::Unsupported(_))));
        assert!(matches!(seq.resize(4, 0), Err(MmapAllocError::Unsupported(_))));
        assert!(matches!(seq.extend_from_slice(&[1, 2]), Err(MmapAllocError::Unsupported(_))));
        assert_eq!(seq.len(), 3);
        seq.resize(1, 0).expect("shrink");
        seq.resize(3, 5).expect("regrow within capacity");
        assert_eq!(seq.as_slice(), &[0, 5, 5]);
    }

    #[test]
    fn double_map_keeps_first_state() {
        let mut seq = MappedSequence::<u8>::default();
        seq.map(8).expect("map");
        assert!(matches!(seq.map(16), Err(MmapAllocError::AlreadyMapped)));
        assert_eq!(seq.len(), 8);
        assert_eq!(seq.capacity(), 8);
    }

    #[test]
    fn unmapped_sequence_is_empty() {
        let mut seq = MappedSequence::<u64>::default();
        assert!(seq.as_slice().is_empty());
        assert!(seq.unmap().is_ok());
        assert!(matches!(seq.push(1), Err(MmapAllocError::Unsupported(_))));
    }
}
