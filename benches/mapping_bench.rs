use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mmap_alloc::{
    AccessMode, FileMappingPool, MappedSequence, MappingAllocator, MappingFlags, MappingKey,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

// Simple helper to build a unique temp path per bench
fn tmp_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("mmap_alloc_bench_{}_{}", name, std::process::id()));
    p
}

fn data_file(name: &str, size: usize) -> PathBuf {
    let path = tmp_path(name);
    fs::write(&path, vec![0x5A_u8; size]).expect("write bench file");
    path
}

fn bench_pool_acquire_release(b: &mut Criterion) {
    let mut group = b.benchmark_group("pool_acquire_release");
    for &size in &[4_usize * 1024, 64 * 1024, 1024 * 1024] {
        let path = data_file(&format!("pool_{}", size), size);
        let pool = FileMappingPool::new();
        let key = MappingKey::new(&path, AccessMode::ReadOnly, 0);

        // Cold: every iteration creates and destroys the OS mapping.
        group.bench_with_input(BenchmarkId::new("cold", size), &size, |ben, &sz| {
            ben.iter(|| {
                let lease = pool.acquire(&key, sz, MappingFlags::NONE).expect("acquire");
                pool.release(lease.key(), lease.len()).expect("release");
            });
        });

        // Warm: a held reference keeps the mapping alive, so iterations only touch refcounts.
        let held = pool.acquire(&key, size, MappingFlags::NONE).expect("hold");
        group.bench_with_input(BenchmarkId::new("warm", size), &size, |ben, &sz| {
            ben.iter(|| {
                let lease = pool.acquire(&key, sz, MappingFlags::NONE).expect("acquire");
                pool.release(lease.key(), lease.len()).expect("release");
            });
        });
        pool.release(held.key(), held.len()).expect("release held");

        let _ = fs::remove_file(&path);
    }
    group.finish();
}

fn bench_private_map(b: &mut Criterion) {
    let mut group = b.benchmark_group("private_map");
    for &size in &[4_usize * 1024, 1024 * 1024] {
        let path = data_file(&format!("private_{}", size), size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |ben, &sz| {
            let mut alloc =
                MappingAllocator::<u8>::new(&path, AccessMode::ReadOnly, 0, MappingFlags::BYPASS_POOL);
            ben.iter(|| {
                let ptr = alloc.allocate(sz).expect("allocate");
                alloc.deallocate(ptr, sz).expect("deallocate");
            });
        });
        let _ = fs::remove_file(&path);
    }
    group.finish();
}

fn bench_sequence_sum(b: &mut Criterion) {
    let mut group = b.benchmark_group("sequence_sum");
    let size = 1024 * 1024;
    let path = data_file("sum", size);
    let pool = Arc::new(FileMappingPool::new());
    let alloc = MappingAllocator::<u32>::builder(&path).pool(pool).build();
    let seq = MappedSequence::with_len(alloc, size / 4).expect("map");

    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("u32", |ben| {
        ben.iter(|| seq.iter().map(|&v| u64::from(v)).sum::<u64>());
    });
    group.finish();

    drop(seq);
    let _ = fs::remove_file(&path);
}

fn criterion_config() -> Criterion {
    Criterion::default()
        .sample_size(30)
        .warm_up_time(std::time::Duration::from_millis(300))
        .measurement_time(std::time::Duration::from_secs(3))
}

criterion_group! {
    name = mapping_benches;
    config = criterion_config();
    targets =
        bench_pool_acquire_release,
        bench_private_map,
        bench_sequence_sum
}

criterion_main!(mapping_benches);
