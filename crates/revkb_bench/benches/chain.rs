//! Validity chain benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use revkb_core::{ChainSlot, ValidityChain, CURRENT_REV};

/// A slot advanced once per revision from 1 to `len`.
fn chain_of(len: u64) -> ChainSlot<u64> {
    let slot = ChainSlot::new();
    for revision in 1..=len {
        slot.advance(revision, revision).unwrap();
    }
    slot
}

/// Benchmark publishing new chain nodes.
fn bench_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_advance");
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("1000_revisions", |b| {
        b.iter(|| black_box(chain_of(1_000)));
    });
    group.finish();
}

/// Benchmark finding the node covering a revision.
fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_find");

    for len in [16u64, 256, 4096].iter() {
        let slot = chain_of(*len);
        group.bench_with_input(BenchmarkId::new("head", len), len, |b, _| {
            b.iter(|| black_box(slot.find(black_box(CURRENT_REV))));
        });
        group.bench_with_input(BenchmarkId::new("oldest", len), len, |b, _| {
            b.iter(|| black_box(slot.find(black_box(1))));
        });
    }
    group.finish();
}

/// Benchmark inserting loaded nodes below the head, newest first.
fn bench_insert_history(c: &mut Criterion) {
    c.bench_function("chain_insert_256_loaded", |b| {
        b.iter(|| {
            let slot = ChainSlot::new();
            slot.insert(ValidityChain::new(512, CURRENT_REV, 256u64).unwrap())
                .unwrap();
            for i in (0..256u64).rev() {
                let node = ValidityChain::new(i * 2 + 1, i * 2 + 1, i).unwrap();
                slot.insert(node).unwrap();
            }
            black_box(slot.len())
        });
    });
}

/// Benchmark truncating history.
fn bench_truncate(c: &mut Criterion) {
    c.bench_function("chain_truncate_4096", |b| {
        b.iter_batched(
            || chain_of(4_096),
            |slot| black_box(slot.truncate_before(4_000)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_advance,
    bench_find,
    bench_insert_history,
    bench_truncate
);
criterion_main!(benches);
