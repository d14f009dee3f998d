//! Insert and query throughput benchmark.
//!
//! Measures single-pattern insert cost and top-k query latency over a
//! populated store, plus the raw kernel batch path.
//!
//! Run: cargo bench --bench query_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use resonancedb::{CompareOptions, ResonanceKernel, ResonanceStore, ScalarKernel, WavePattern};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_pattern(seed: usize, len: usize) -> WavePattern {
    let amp: Vec<f64> = (0..len)
        .map(|i| 0.1 + ((seed * 7 + i) % 97) as f64 * 0.01)
        .collect();
    let phase: Vec<f64> = (0..len)
        .map(|i| ((seed * 13 + i * 5) % 311) as f64 * 0.01)
        .collect();
    WavePattern::new(amp, phase).unwrap()
}

fn populated_store(count: usize, len: usize) -> (TempDir, ResonanceStore) {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    for i in 0..count {
        store.insert(&make_pattern(i, len), None).unwrap();
    }
    (dir, store)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    for len in [64usize, 1024] {
        group.bench_with_input(BenchmarkId::new("pattern_len", len), &len, |b, &len| {
            let dir = TempDir::new().unwrap();
            let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
            let mut i = 0usize;
            b.iter(|| {
                store.insert(&make_pattern(i, len), None).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_top10");
    group.sample_size(20);
    for count in [100usize, 1000] {
        group.bench_with_input(BenchmarkId::new("patterns", count), &count, |b, &count| {
            let (_dir, store) = populated_store(count, 64);
            let query = make_pattern(count / 2, 64);
            b.iter(|| {
                let matches = store.query(black_box(&query), 10).unwrap();
                black_box(matches);
            });
        });
    }
    group.finish();
}

fn bench_kernel_batch(c: &mut Criterion) {
    let kernel = ScalarKernel::default();
    let query = make_pattern(0, 256);
    let candidates: Vec<WavePattern> = (1..=4096).map(|i| make_pattern(i, 256)).collect();

    c.bench_function("kernel_compare_many_4096x256", |b| {
        b.iter(|| {
            let scores =
                kernel.compare_many(black_box(&query), &candidates, &CompareOptions::default());
            black_box(scores);
        });
    });
}

criterion_group!(benches, bench_insert, bench_query, bench_kernel_batch);
criterion_main!(benches);
