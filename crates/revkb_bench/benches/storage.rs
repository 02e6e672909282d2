//! Storage backend benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use revkb_codec::{RevisionNumber, Value, TRUNK};
use revkb_storage::{
    ColumnFilter, CommitBatch, FileBackend, InMemoryBackend, RevisionRow, RowChange,
    StorageBackend,
};
use tempfile::TempDir;

fn batch(number: RevisionNumber, first_id: u64, size: u64) -> CommitBatch {
    CommitBatch {
        revision: RevisionRow {
            number,
            author: "bench".into(),
            date_millis: 0,
            log: String::new(),
        },
        base: None,
        changes: (first_id..first_id + size)
            .map(|id| RowChange::Create {
                table: "Person".into(),
                branch: TRUNK,
                id,
                values: vec![
                    Value::from(format!("person_{id}")),
                    Value::from(if id % 2 == 0 { "paris" } else { "rome" }),
                ],
            })
            .collect(),
    }
}

/// A backend holding `rows` people created over `rows / 100` revisions.
fn filled(rows: u64) -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    for (i, first) in (0..rows).step_by(100).enumerate() {
        backend
            .commit(batch(i as u64 + 1, first, 100.min(rows - first)))
            .unwrap();
    }
    backend
}

/// Benchmark in-memory commits of different batch sizes.
fn bench_memory_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_commit");

    for size in [1u64, 10, 100].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let backend = InMemoryBackend::new();
            let mut number = 0;
            b.iter(|| {
                number += 1;
                backend
                    .commit(black_box(batch(number, number * size, size)))
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark journaled commits without fsync.
fn bench_file_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_commit");

    for size in [1u64, 100].iter() {
        group.throughput(Throughput::Elements(*size));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let backend = FileBackend::open(&dir.path().join("store"), false).unwrap();
            let mut number = 0;
            b.iter(|| {
                number += 1;
                backend
                    .commit(black_box(batch(number, number * size, size)))
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark scans with and without a column filter.
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    let backend = filled(10_000);
    let last = backend.last_revision().unwrap();
    let paris = [ColumnFilter::new(1, Value::from("paris"))];

    group.bench_function("all_10000", |b| {
        b.iter(|| black_box(backend.scan("Person", TRUNK, last, &[]).unwrap()));
    });
    group.bench_function("filtered_10000", |b| {
        b.iter(|| black_box(backend.scan("Person", TRUNK, last, &paris).unwrap()));
    });
    group.bench_function("historic_10000", |b| {
        b.iter(|| black_box(backend.scan("Person", TRUNK, last / 2, &[]).unwrap()));
    });
    group.finish();
}

/// Benchmark replaying a journal on open.
fn bench_replay(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let backend = FileBackend::open(&path, false).unwrap();
        for number in 1..=100 {
            backend.commit(batch(number, number * 100, 100)).unwrap();
        }
        backend.sync().unwrap();
    }

    c.bench_function("replay_100_commits", |b| {
        b.iter(|| black_box(FileBackend::open(&path, false).unwrap().last_revision()));
    });
}

criterion_group!(
    benches,
    bench_memory_commit,
    bench_file_commit,
    bench_scan,
    bench_replay
);
criterion_main!(benches);
