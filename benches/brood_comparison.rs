//! Benchmarks comparing brood against the slab crate.
//!
//! Run with: cargo bench
//!
//! Both containers are pre-allocated for fair comparison. The cases that
//! matter most are iteration over fragmented storage (brood's skipfield
//! hops erased runs; slab visits every slot) and reinsertion after heavy
//! erasure.

use brood::Brood;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

const CAPACITY: usize = 100_000;

// ============================================================================
// Insert Benchmarks
// ============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(CAPACITY as u64));

    // Pre-allocate once, reuse via clear()
    let mut brood: Brood<u64> = Brood::new();
    brood.reserve(CAPACITY).unwrap();
    let mut slab_crate = slab::Slab::<u64>::with_capacity(CAPACITY);

    group.bench_function("brood", |b| {
        b.iter(|| {
            for i in 0..CAPACITY as u64 {
                black_box(brood.insert(i));
            }
            brood.clear();
        });
    });

    group.bench_function("slab", |b| {
        b.iter(|| {
            for i in 0..CAPACITY as u64 {
                black_box(slab_crate.insert(i));
            }
            slab_crate.clear();
        });
    });

    group.finish();
}

// ============================================================================
// Iteration Benchmarks (Dense)
// ============================================================================

fn bench_iterate_dense(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate_dense");
    group.throughput(Throughput::Elements(CAPACITY as u64));

    let mut brood: Brood<u64> = Brood::new();
    let mut slab_crate = slab::Slab::<u64>::with_capacity(CAPACITY);
    for i in 0..CAPACITY as u64 {
        brood.insert(i);
        slab_crate.insert(i);
    }

    group.bench_function("brood", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for value in brood.iter() {
                sum += *value;
            }
            black_box(sum)
        });
    });

    group.bench_function("slab", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for (_, value) in slab_crate.iter() {
                sum += *value;
            }
            black_box(sum)
        });
    });

    group.finish();
}

// ============================================================================
// Iteration Benchmarks (Fragmented: 75% erased)
// ============================================================================

fn bench_iterate_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate_fragmented");
    group.throughput(Throughput::Elements((CAPACITY / 4) as u64));

    let mut brood: Brood<u64> = Brood::new();
    let mut slab_crate = slab::Slab::<u64>::with_capacity(CAPACITY);
    let cursors: Vec<_> = (0..CAPACITY as u64).map(|i| brood.insert(i)).collect();
    let keys: Vec<_> = (0..CAPACITY as u64).map(|i| slab_crate.insert(i)).collect();

    for (i, cursor) in cursors.iter().enumerate() {
        if i % 4 != 0 {
            unsafe {
                brood.erase(*cursor);
            }
        }
    }
    for (i, key) in keys.iter().enumerate() {
        if i % 4 != 0 {
            slab_crate.remove(*key);
        }
    }

    group.bench_function("brood", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for value in brood.iter() {
                sum += *value;
            }
            black_box(sum)
        });
    });

    group.bench_function("slab", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for (_, value) in slab_crate.iter() {
                sum += *value;
            }
            black_box(sum)
        });
    });

    group.finish();
}

// ============================================================================
// Erase Benchmarks
// ============================================================================

fn bench_erase(c: &mut Criterion) {
    let mut group = c.benchmark_group("erase");
    group.throughput(Throughput::Elements(CAPACITY as u64));

    group.bench_function("brood", |b| {
        b.iter_with_setup(
            || {
                let mut brood: Brood<u64> = Brood::new();
                let cursors: Vec<_> = (0..CAPACITY as u64).map(|i| brood.insert(i)).collect();
                (brood, cursors)
            },
            |(mut brood, cursors)| {
                for cursor in cursors {
                    unsafe {
                        brood.erase(cursor);
                    }
                }
                black_box(brood.len())
            },
        );
    });

    group.bench_function("slab", |b| {
        b.iter_with_setup(
            || {
                let mut slab_crate = slab::Slab::<u64>::with_capacity(CAPACITY);
                let keys: Vec<_> = (0..CAPACITY as u64).map(|i| slab_crate.insert(i)).collect();
                (slab_crate, keys)
            },
            |(mut slab_crate, keys)| {
                for key in keys {
                    black_box(slab_crate.remove(key));
                }
            },
        );
    });

    group.finish();
}

// ============================================================================
// Churn (erase + reinsert into holes)
// ============================================================================

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    const CYCLES: usize = 100_000;
    group.throughput(Throughput::Elements(CYCLES as u64 * 2));

    let mut brood: Brood<u64> = Brood::new();
    for i in 0..1024u64 {
        brood.insert(i);
    }
    let mut slab_crate = slab::Slab::<u64>::with_capacity(1024);
    for i in 0..1024u64 {
        slab_crate.insert(i);
    }

    group.bench_function("brood", |b| {
        b.iter(|| {
            for i in 0..CYCLES as u64 {
                let cursor = brood.insert(i);
                unsafe {
                    black_box(brood.erase(cursor));
                }
            }
        });
    });

    group.bench_function("slab", |b| {
        b.iter(|| {
            for i in 0..CYCLES as u64 {
                let key = slab_crate.insert(i);
                black_box(slab_crate.remove(key));
            }
        });
    });

    group.finish();
}

// ============================================================================
// Bulk fill
// ============================================================================

fn bench_bulk_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_fill");
    group.throughput(Throughput::Elements(CAPACITY as u64));

    group.bench_function("brood/insert_fill", |b| {
        b.iter_with_setup(
            || Brood::<u64>::new(),
            |mut brood| {
                brood.insert_fill(CAPACITY, 1).unwrap();
                black_box(brood.len())
            },
        );
    });

    group.bench_function("brood/insert_loop", |b| {
        b.iter_with_setup(
            || Brood::<u64>::new(),
            |mut brood| {
                for _ in 0..CAPACITY {
                    brood.insert(1);
                }
                black_box(brood.len())
            },
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_iterate_dense,
    bench_iterate_fragmented,
    bench_erase,
    bench_churn,
    bench_bulk_fill,
);

criterion_main!(benches);
