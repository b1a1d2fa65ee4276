//! Tests for size and range validation

use mmap_alloc::{
    AccessMode, FileMappingPool, MappedRegion, MappedSequence, MappingAllocator, MappingFlags,
    MappingKey, MmapAllocError,
};
use std::fs;
use std::sync::Arc;

#[test]
fn test_element_count_overflow() {
    let mut alloc = MappingAllocator::<u64>::heap();
    let result = alloc.allocate(usize::MAX);
    assert!(matches!(result, Err(MmapAllocError::Unsupported(_))));
    assert!(!alloc.is_allocated());
}

#[test]
fn test_zero_length_mapping_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("zero_len.bin");
    fs::write(&path, [1u8; 32]).expect("write");

    let pool = Arc::new(FileMappingPool::new());
    let mut seq = MappedSequence::new(
        MappingAllocator::<u32>::builder(&path).pool(pool.clone()).build(),
    );
    let err = seq.map(0).unwrap_err();
    assert!(matches!(err, MmapAllocError::Mapping { .. }));
    assert!(err.raw_os_error().is_some());
    assert!(!seq.is_mapped());
    assert!(pool.is_empty());
}

#[test]
fn test_zero_length_read_write_does_not_create_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("never_created.bin");

    let err = MappedRegion::open(&path, AccessMode::ReadWrite, 0, 0).unwrap_err();
    assert!(matches!(err, MmapAllocError::Mapping { .. }));
    assert!(!path.exists());
}

#[test]
fn test_empty_file_whole_mapping_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty.bin");
    fs::write(&path, []).expect("write");

    let err = MappedRegion::open_whole(&path, AccessMode::ReadOnly).unwrap_err();
    assert!(matches!(err, MmapAllocError::Mapping { .. }));
}

#[test]
fn test_read_only_request_past_end_of_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("short.bin");
    fs::write(&path, [0u8; 100]).expect("write");

    let pool = FileMappingPool::new();
    let key = MappingKey::new(&path, AccessMode::ReadOnly, 64);
    let err = pool.acquire(&key, 64, MappingFlags::NONE).unwrap_err();
    assert!(matches!(err, MmapAllocError::OutOfBounds { offset: 64, len: 64, total: 100 }));
    assert!(pool.is_empty());
}

#[test]
fn test_read_write_extends_short_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("grow_file.bin");
    fs::write(&path, [0u8; 10]).expect("write");

    let region = MappedRegion::open(&path, AccessMode::ReadWrite, 8192, 100).expect("open");
    assert_eq!(region.len(), 100);
    region.close();
    assert_eq!(fs::metadata(&path).expect("metadata").len(), 8292);
}

#[test]
fn test_offset_overflow() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("overflow.bin");
    fs::write(&path, [0u8; 10]).expect("write");

    let err = MappedRegion::open(&path, AccessMode::ReadOnly, u64::MAX, 10).unwrap_err();
    assert!(matches!(err, MmapAllocError::OutOfBounds { .. }));
}
