//! Aligned allocation benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use heapwrap_core::{DerivedOps, SystemPrimitive};

fn bench_memalign_free(c: &mut Criterion) {
    let ops = DerivedOps::new(SystemPrimitive::new());
    let mut group = c.benchmark_group("memalign_free");

    // 16 is satisfied by the first attempt; larger alignments reach the
    // over-allocation path and the side table.
    for &alignment in &[16usize, 64, 4096, 65536] {
        group.bench_with_input(
            BenchmarkId::new("align", alignment),
            &alignment,
            |b, &alignment| {
                b.iter(|| {
                    let p = ops.memalign(alignment, 200).unwrap().as_ptr();
                    unsafe { ops.free(criterion::black_box(p)) };
                });
            },
        );
    }
    group.finish();
}

fn bench_calloc(c: &mut Criterion) {
    let ops = DerivedOps::new(SystemPrimitive::new());
    let mut group = c.benchmark_group("calloc");

    for &size in &[64usize, 4096, 65536] {
        group.bench_with_input(BenchmarkId::new("zeroed", size), &size, |b, &size| {
            b.iter(|| {
                let p = ops.calloc(1, size).unwrap().as_ptr();
                unsafe { ops.free(criterion::black_box(p)) };
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_memalign_free, bench_calloc);
criterion_main!(benches);
