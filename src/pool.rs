//! Process-wide registry that shares and reference-counts file mappings.
//!
//! Requests are keyed by [`MappingKey`] (path, access mode, file offset). Two
//! requests with the same key share one [`MappedRegion`] as long as the existing
//! region covers the requested length. A region created with
//! [`MappingFlags::MAP_WHOLE_FILE`] is registered under the key it was requested
//! for and satisfies any later request for a sub-range of the file in the same
//! mode.
//!
//! Locking is two-level: a short-lived table lock maps keys to slots, and each
//! slot carries its own lock. Refcount updates and region creation or teardown
//! for one key happen under that key's slot lock only, so opening a file for one
//! key does not stall requests for others. The table lock is never held while
//! waiting on a slot lock.

use std::{
    collections::HashMap,
    fmt,
    io,
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

use crate::errors::{MmapAllocError, Result};
use crate::mode::{AccessMode, MappingFlags};
use crate::region::MappedRegion;
use crate::utils::{to_u64, to_usize};

/// Identity of a class of shareable mapping requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    path: PathBuf,
    mode: AccessMode,
    offset: u64,
}

impl MappingKey {
    /// Build a key for `path` mapped in `mode` starting at byte `offset`.
    pub fn new<P: Into<PathBuf>>(path: P, mode: AccessMode, offset: u64) -> Self {
        Self {
            path: path.into(),
            mode,
            offset,
        }
    }

    /// Key naming the same path and mode at offset 0.
    #[must_use]
    pub fn file_key(&self) -> Self {
        Self {
            path: self.path.clone(),
            mode: self.mode,
            offset: 0,
        }
    }

    /// Mapped file.
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
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({:?})", self.path.display(), self.offset, self.mode)
    }
}

/// A successful [`FileMappingPool::acquire`].
///
/// Holds the key the pool actually charged, which may be the key of a
/// whole-file mapping rather than the requested one. Pass that key back to
/// [`FileMappingPool::release`].
#[derive(Debug)]
pub struct Lease {
    key: MappingKey,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the lease is a receipt for memory owned by the pool; it carries the
// address but never dereferences it.
unsafe impl Send for Lease {}
// SAFETY: see above.
unsafe impl Sync for Lease {}

impl Lease {
    /// Key holding the reference this lease represents.
    #[must_use]
    pub fn key(&self) -> &MappingKey {
        &self.key
    }

    /// Pointer to the first requested byte.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Number of bytes requested.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the lease covers no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A pool entry still referenced when a leak check ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedMapping {
    /// Key of the surviving entry.
    pub key: MappingKey,
    /// Outstanding references.
    pub refs: usize,
    /// Page-aligned size of the surviving mapping.
    pub mapped_len: usize,
}

struct Entry {
    region: MappedRegion,
    refs: usize,
    whole_file: bool,
}

impl Entry {
    fn lease(&self, key: &MappingKey, offset: u64, len: usize) -> Result<Lease> {
        let delta = to_usize(offset - self.region.offset())?;
        // SAFETY: `covers` was checked by the caller, so base + delta stays inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(self.region.as_ptr().as_ptr().add(delta)) };
        Ok(Lease {
            key: key.clone(),
            ptr,
            len,
        })
    }
}

#[derive(Default)]
struct Slot {
    entry: Option<Entry>,
    /// Set once the slot is unlinked from the table; holders must look up again.
    retired: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

#[derive(Default)]
struct Table {
    slots: HashMap<MappingKey, SlotRef>,
    /// Registered keys grouped by [`MappingKey::file_key`], searched for whole-file entries.
    by_file: HashMap<MappingKey, Vec<MappingKey>>,
}

impl Table {
    fn unlink(&mut self, key: &MappingKey) {
        self.slots.remove(key);
        let file = key.file_key();
        if let Some(keys) = self.by_file.get_mut(&file) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.by_file.remove(&file);
            }
        }
    }
}

/// Shared, reference-counted registry of file mappings.
///
/// Most code uses the process-wide instance from [`FileMappingPool::global`].
/// Separate instances are independent and useful for isolation in tests.
#[derive(Default)]
pub struct FileMappingPool {
    table: Mutex<Table>,
}

impl fmt::Debug for FileMappingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMappingPool")
            .field("regions", &self.region_count())
            .finish()
    }
}

static GLOBAL_POOL: OnceLock<Arc<FileMappingPool>> = OnceLock::new();

impl FileMappingPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool, created on first use.
    #[must_use]
    pub fn global() -> Arc<FileMappingPool> {
        GLOBAL_POOL
            .get_or_init(|| {
                log::debug!("initializing global mapping pool");
                Arc::new(FileMappingPool::new())
            })
            .clone()
    }

    /// Obtain `len` bytes of the file range described by `key`.
    ///
    /// Reuses an existing whole-file mapping that covers the range, then an
    /// existing mapping under the target key; otherwise opens a new region and
    /// registers it with a refcount of one.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::Mapping` if `len` is zero or the OS mapping fails.
    /// Returns `MmapAllocError::OutOfBounds` if the range lies outside the file.
    /// Returns `MmapAllocError::Unsupported` if a shorter mapping is already live
    /// under the key, since growing it would require remapping.
    pub fn acquire(&self, key: &MappingKey, len: usize, flags: MappingFlags) -> Result<Lease> {
        if len == 0 {
            return Err(MmapAllocError::Mapping {
                path: key.path.clone(),
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        if let Some(lease) = self.share_whole_file(key, len)? {
            return Ok(lease);
        }

        let whole_file = flags.contains(MappingFlags::MAP_WHOLE_FILE);
        loop {
            let slot = self.slot_for(key);
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            if let Some(entry) = guard.entry.as_mut() {
                if !entry.region.covers(key.offset, len) {
                    if entry.whole_file {
                        return Err(MmapAllocError::OutOfBounds {
                            offset: key.offset,
                            len: to_u64(len)?,
                            total: to_u64(entry.region.len())?,
                        });
                    }
                    return Err(MmapAllocError::Unsupported(
                        "live mapping for this key is shorter than the request; remapping is not implemented",
                    ));
                }
                entry.refs += 1;
                log::trace!("pool: shared {} refs={}", key, entry.refs);
                return entry.lease(key, key.offset, len);
            }

            let opened = if whole_file {
                MappedRegion::open_whole(&key.path, key.mode)
            } else {
                MappedRegion::open(&key.path, key.mode, key.offset, len)
            };
            let region = match opened {
                Ok(region) if region.covers(key.offset, len) => region,
                Ok(region) => {
                    let total = to_u64(region.len())?;
                    drop(guard);
                    region.close();
                    self.retire_if_empty(key, &slot);
                    return Err(MmapAllocError::OutOfBounds {
                        offset: key.offset,
                        len: to_u64(len)?,
                        total,
                    });
                }
                Err(e) => {
                    drop(guard);
                    self.retire_if_empty(key, &slot);
                    return Err(e);
                }
            };
            let entry = guard.entry.insert(Entry {
                region,
                refs: 1,
                whole_file,
            });
            log::trace!("pool: created {} refs=1 whole_file={}", key, whole_file);
            return entry.lease(key, key.offset, len);
        }
    }

    /// Drop one reference to the mapping registered under `key`.
    ///
    /// The mapping is unmapped and its entry removed when the count reaches zero.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::PoolConsistency` if the pool has no live entry
    /// for `key`. The pool is left unchanged; the error indicates a caller bug
    /// and must not be ignored.
    pub fn release(&self, key: &MappingKey, len: usize) -> Result<()> {
        let slot = self.table.lock().slots.get(key).cloned();
        let Some(slot) = slot else {
            return Err(inconsistent(key));
        };
        let mut guard = slot.lock();
        let Some(entry) = guard.entry.as_mut() else {
            return Err(inconsistent(key));
        };
        entry.refs = match entry.refs.checked_sub(1) {
            Some(refs) => refs,
            None => return Err(inconsistent(key)),
        };
        log::trace!("pool: released {} ({} bytes) refs={}", key, len, entry.refs);
        if entry.refs > 0 {
            return Ok(());
        }
        if let Some(entry) = guard.entry.take() {
            entry.region.close();
        }
        drop(guard);
        self.retire_if_empty(key, &slot);
        Ok(())
    }

    /// Flush `len` bytes of a read-write lease to disk. No-op for other modes.
    ///
    /// # Errors
    ///
    /// Returns `MmapAllocError::PoolConsistency` if the lease's entry is gone.
    /// Returns `MmapAllocError::FlushFailed` if the OS flush fails.
    pub fn flush(&self, lease: &Lease) -> Result<()> {
        let slot = self.table.lock().slots.get(&lease.key).cloned();
        let slot = slot.ok_or_else(|| inconsistent(&lease.key))?;
        let guard = slot.lock();
        let entry = guard.entry.as_ref().ok_or_else(|| inconsistent(&lease.key))?;
        let base = entry.region.as_ptr().as_ptr() as usize;
        let start = lease.ptr.as_ptr() as usize - base;
        entry.region.flush_range(start, lease.len)
    }

    /// Outstanding references for `key`, if it has a live entry.
    #[must_use]
    pub fn refcount(&self, key: &MappingKey) -> Option<usize> {
        let slot = self.table.lock().slots.get(key).cloned()?;
        let guard = slot.lock();
        guard.entry.as_ref().map(|e| e.refs)
    }

    /// Number of live OS mappings held by the pool.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the pool holds no live mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region_count() == 0
    }

    /// Entries that are still referenced.
    #[must_use]
    pub fn leaks(&self) -> Vec<LeakedMapping> {
        self.snapshot()
    }

    /// Leak check for process teardown: logs and returns every surviving entry.
    ///
    /// Surviving mappings are left in place since their holders may still
    /// dereference them.
    pub fn shutdown(&self) -> Vec<LeakedMapping> {
        let leaks = self.snapshot();
        for leak in &leaks {
            log::warn!(
                "mapping pool leak: {} still has {} reference(s), {} bytes mapped",
                leak.key,
                leak.refs,
                leak.mapped_len
            );
        }
        leaks
    }

    fn snapshot(&self) -> Vec<LeakedMapping> {
        let slots: Vec<(MappingKey, SlotRef)> = self
            .table
            .lock()
            .slots
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let guard = slot.lock();
                guard.entry.as_ref().map(|e| LeakedMapping {
                    key,
                    refs: e.refs,
                    mapped_len: e.region.mapped_len(),
                })
            })
            .collect()
    }

    /// Charge `len` bytes at `key.offset` to a live whole-file mapping of the same file.
    fn share_whole_file(&self, key: &MappingKey, len: usize) -> Result<Option<Lease>> {
        let candidates: Vec<(MappingKey, SlotRef)> = {
            let table = self.table.lock();
            let Some(keys) = table.by_file.get(&key.file_key()) else {
                return Ok(None);
            };
            keys.iter()
                .filter_map(|k| table.slots.get(k).map(|slot| (k.clone(), slot.clone())))
                .collect()
        };
        for (whole_key, slot) in candidates {
            let mut guard = slot.lock();
            if guard.retired {
                continue;
            }
            let Some(entry) = guard
                .entry
                .as_mut()
                .filter(|e| e.whole_file && e.region.covers(key.offset, len))
            else {
                continue;
            };
            entry.refs += 1;
            log::trace!("pool: {}+{} shares {} refs={}", key, len, whole_key, entry.refs);
            return entry.lease(&whole_key, key.offset, len).map(Some);
        }
        Ok(None)
    }

    fn slot_for(&self, key: &MappingKey) -> SlotRef {
        let mut table = self.table.lock();
        if let Some(slot) = table.slots.get(key) {
            return slot.clone();
        }
        let slot = SlotRef::default();
        table.slots.insert(key.clone(), slot.clone());
        table.by_file.entry(key.file_key()).or_default().push(key.clone());
        slot
    }

    /// Unlink `slot` from the table if it still holds no entry.
    ///
    /// Never waits on the slot while holding the table lock: if another thread
    /// holds the slot (possibly opening a region), wait for it outside the
    /// table lock and retry.
    fn retire_if_empty(&self, key: &MappingKey, slot: &SlotRef) {
        loop {
            let mut table = self.table.lock();
            if !table.slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                return;
            }
            if let Some(mut guard) = slot.try_lock() {
                if guard.entry.is_none() {
                    guard.retired = true;
                    table.unlink(key);
                }
                return;
            }
            drop(table);
            if slot.lock().entry.is_some() {
                return;
            }
        }
    }
}

impl Drop for FileMappingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn inconsistent(key: &MappingKey) -> MmapAllocError {
    log::error!("mapping pool inconsistency: release of {key} without a live entry");
    MmapAllocError::PoolConsistency { key: key.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_all(&bytes).expect("write");
        f.flush().expect("flush");
        f
    }

    #[test]
    fn table_is_cleaned_after_last_release() {
        let f = file_with(8192);
        let pool = FileMappingPool::new();
        let key = MappingKey::new(f.path(), AccessMode::ReadOnly, 0);
        let lease = pool.acquire(&key, 100, MappingFlags::NONE).expect("acquire");
        assert_eq!(pool.table.lock().slots.len(), 1);
        pool.release(lease.key(), lease.len()).expect("release");
        let table = pool.table.lock();
        assert!(table.slots.is_empty());
        assert!(table.by_file.is_empty());
    }

    #[test]
    fn failed_open_leaves_no_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = FileMappingPool::new();
        let key = MappingKey::new(dir.path().join("missing"), AccessMode::ReadOnly, 0);
        assert!(pool.acquire(&key, 16, MappingFlags::NONE).is_err());
        let table = pool.table.lock();
        assert!(table.slots.is_empty());
        assert!(table.by_file.is_empty());
    }

    #[test]
    fn whole_file_too_short_is_out_of_bounds() {
        let f = file_with(100);
        let pool = FileMappingPool::new();
        let key = MappingKey::new(f.path(), AccessMode::ReadOnly, 50);
        let err = pool
            .acquire(&key, 100, MappingFlags::MAP_WHOLE_FILE)
            .unwrap_err();
        assert!(matches!(err, MmapAllocError::OutOfBounds { offset: 50, len: 100, total: 100 }));
        assert!(pool.is_empty());
    }

    #[test]
    fn longer_request_on_short_mapping_is_unsupported() {
        let f = file_with(8192);
        let pool = FileMappingPool::new();
        let key = MappingKey::new(f.path(), AccessMode::ReadOnly, 0);
        let lease = pool.acquire(&key, 100, MappingFlags::NONE).expect("acquire");
        let err = pool.acquire(&key, 200, MappingFlags::NONE).unwrap_err();
        assert!(matches!(err, MmapAllocError::Unsupported(_)));
        assert_eq!(pool.refcount(&key), Some(1));
        pool.release(lease.key(), lease.len()).expect("release");
    }

    #[test]
    fn request_past_whole_file_mapping_is_out_of_bounds() {
        let f = file_with(4096);
        let pool = FileMappingPool::new();
        let key = MappingKey::new(f.path(), AccessMode::ReadOnly, 1024);
        let whole = pool
            .acquire(&key, 16, MappingFlags::MAP_WHOLE_FILE)
            .expect("whole");
        let err = pool.acquire(&key, 8192, MappingFlags::NONE).unwrap_err();
        assert!(matches!(err, MmapAllocError::OutOfBounds { offset: 1024, len: 8192, total: 4096 }));
        assert_eq!(pool.refcount(&key), Some(1));
        pool.release(whole.key(), whole.len()).expect("release");
    }

    #[test]
    fn retire_waits_for_slot_holder_outside_table_lock() {
        let f = file_with(8192);
        let g = file_with(8192);
        let pool = FileMappingPool::new();
        let key = MappingKey::new(f.path(), AccessMode::ReadOnly, 0);
        let other = MappingKey::new(g.path(), AccessMode::ReadOnly, 0);
        let slot = pool.slot_for(&key);
        let held = slot.lock();

        std::thread::scope(|s| {
            let retire = s.spawn(|| pool.retire_if_empty(&key, &slot));
            // The table stays usable while the slot is held.
            let lease = pool.acquire(&other, 16, MappingFlags::NONE).expect("other key");
            pool.release(lease.key(), lease.len()).expect("release");
            drop(held);
            retire.join().expect("retire thread");
        });

        assert!(slot.lock().retired);
        assert!(pool.table.lock().slots.is_empty());
    }

    #[test]
    fn key_display() {
        let key = MappingKey::new("/tmp/data.bin", AccessMode::ReadWrite, 64);
        assert_eq!(key.to_string(), "/tmp/data.bin@64 (ReadWrite)");
        assert_eq!(key.file_key(), MappingKey::new("/tmp/data.bin", AccessMode::ReadWrite, 0));
    }
}
