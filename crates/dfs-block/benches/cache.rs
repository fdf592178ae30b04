#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dfs_block::{BufCache, ByteDevice, MemByteDevice};
use dfs_types::{BlockNumber, DeviceId, SECTOR_SIZE};
use std::sync::Arc;

fn make_cache(block_count: usize, capacity: usize) -> BufCache {
    let cache = BufCache::new(capacity);
    let dev = Arc::new(MemByteDevice::new(block_count * SECTOR_SIZE));
    cache
        .register(DeviceId(0), dev as Arc<dyn ByteDevice>)
        .expect("register");
    cache
}

fn bench_cache_hit(c: &mut Criterion) {
    let cache = make_cache(16, 8);

    // Warm up: read block 0 once (miss), then benchmark repeated hits.
    drop(cache.acquire(DeviceId(0), BlockNumber(0)).expect("warmup"));

    c.bench_function("buf_cache_hit", |b| {
        b.iter(|| {
            let guard = cache
                .acquire(DeviceId(0), black_box(BlockNumber(0)))
                .expect("hit");
            black_box(guard.data()[0]);
        });
    });
}

fn bench_cache_miss(c: &mut Criterion) {
    // Capacity 1: every distinct block rebinds the single entry.
    let cache = make_cache(256, 1);

    let mut block_id = 0_u64;
    c.bench_function("buf_cache_miss", |b| {
        b.iter(|| {
            let guard = cache
                .acquire(DeviceId(0), BlockNumber(block_id % 256))
                .expect("miss");
            black_box(guard.data()[0]);
            block_id += 1;
        });
    });
}

fn bench_cache_mixed_workload(c: &mut Criterion) {
    // 8-entry pool with a 16-block working set → ~50% hit rate.
    let cache = make_cache(16, 8);

    for i in 0..16_u64 {
        drop(cache.acquire(DeviceId(0), BlockNumber(i)).expect("warmup"));
    }

    let mut iter = 0_u64;
    c.bench_function("buf_cache_mixed", |b| {
        b.iter(|| {
            let guard = cache
                .acquire(DeviceId(0), black_box(BlockNumber(iter % 16)))
                .expect("read");
            black_box(guard.data()[0]);
            iter += 1;
        });
    });
}

fn bench_write_through(c: &mut Criterion) {
    let cache = make_cache(16, 8);

    c.bench_function("buf_cache_write_through", |b| {
        b.iter(|| {
            let mut guard = cache.acquire(DeviceId(0), BlockNumber(3)).expect("acquire");
            guard.data_mut()[0] = guard.data()[0].wrapping_add(1);
            guard.mark_dirty().expect("dirty");
            drop(guard);
            cache
                .clear_dirty(DeviceId(0), BlockNumber(3))
                .expect("clear");
        });
    });
}

criterion_group!(
    cache_benches,
    bench_cache_hit,
    bench_cache_miss,
    bench_cache_mixed_workload,
    bench_write_through,
);
criterion_main!(cache_benches);
