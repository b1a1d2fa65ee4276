//! Page-size and alignment helpers shared by the region and pool layers.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{MmapAllocError, Result};

const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get the system page size in bytes.
///
/// The value is queried once and cached for the lifetime of the process.
#[must_use]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = query_page_size();
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

fn query_page_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            // SAFETY: sysconf with _SC_PAGESIZE has no preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(size)
                .ok()
                .filter(|s| s.is_power_of_two())
                .unwrap_or(FALLBACK_PAGE_SIZE)
        } else {
            FALLBACK_PAGE_SIZE
        }
    }
}

/// Align a value up to the nearest multiple of `alignment`.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    if alignment.is_power_of_two() {
        let mask = alignment - 1;
        (value + mask) & !mask
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Align a value down to the nearest multiple of `alignment`.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

/// Ensure the requested [offset, offset+len) range is within [0, total).
///
/// # Errors
///
/// Returns `MmapAllocError::OutOfBounds` if the range exceeds bounds or overflows.
pub fn ensure_in_bounds(offset: u64, len: u64, total: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(MmapAllocError::OutOfBounds { offset, len, total }),
    }
}

/// Convert a byte count to `u64`, failing on platforms where it would not fit.
pub(crate) fn to_u64(len: usize) -> Result<u64> {
    u64::try_from(len).map_err(|_| MmapAllocError::Unsupported("length does not fit in u64"))
}

/// Convert a file length to `usize`, failing when it cannot be addressed.
pub(crate) fn to_usize(len: u64) -> Result<usize> {
    usize::try_from(len).map_err(|_| MmapAllocError::Unsupported("length exceeds address space"))
}
