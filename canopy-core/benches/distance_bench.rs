//! SIMD kernel benchmarks.
//!
//! Measures:
//! - Dot product and squared L2, SIMD vs scalar
//! - Scaling with vector dimensions
//! - Full metric cost (angular needs three dot products)

use canopy_core::distance::{self, Angular, Distance, Euclidean};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

fn vectors(dims: usize) -> (Vec<f32>, Vec<f32>) {
    let a = (0..dims).map(|i| (i as f32).sin() * 0.5).collect();
    let b = (0..dims).map(|i| (i as f32).cos() * 0.5).collect();
    (a, b)
}

/// Benchmark: raw kernels at various dimensions
fn bench_kernels_by_dimension(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernels_by_dimension");

    for dims in [8, 64, 128, 384, 768, 1536] {
        group.throughput(Throughput::Elements(dims as u64));
        let (a, b) = vectors(dims);

        group.bench_with_input(BenchmarkId::new("dot_simd", dims), &dims, |bench, _| {
            bench.iter(|| black_box(distance::dot(black_box(&a), black_box(&b))));
        });

        group.bench_with_input(BenchmarkId::new("dot_scalar", dims), &dims, |bench, _| {
            bench.iter(|| black_box(distance::dot_scalar(black_box(&a), black_box(&b))));
        });

        group.bench_with_input(BenchmarkId::new("l2_simd", dims), &dims, |bench, _| {
            bench.iter(|| black_box(distance::squared_euclidean(black_box(&a), black_box(&b))));
        });

        group.bench_with_input(BenchmarkId::new("l2_scalar", dims), &dims, |bench, _| {
            bench.iter(|| {
                black_box(distance::squared_euclidean_scalar(black_box(&a), black_box(&b)))
            });
        });
    }

    group.finish();
}

/// Benchmark: metric distance as used when ranking candidates
fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    let (a, b) = vectors(768);

    group.bench_function("angular_768d", |bench| {
        bench.iter(|| black_box(Angular::distance(black_box(&a), black_box(&b))));
    });

    group.bench_function("euclidean_768d", |bench| {
        bench.iter(|| black_box(Euclidean::distance(black_box(&a), black_box(&b))));
    });

    group.finish();
}

criterion_group!(benches, bench_kernels_by_dimension, bench_metrics);
criterion_main!(benches);
