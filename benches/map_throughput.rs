//! Benchmarks for map-engine throughput across worker counts

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use scatter::{MapConfig, map};
use std::hint::black_box;

/// CPU-bound stand-in for real per-item work.
fn busy_work(seed: u64) -> u64 {
    let mut x = seed.wrapping_add(0x9e3779b97f4a7c15);
    for _ in 0..2_000 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
    }
    x
}

fn bench_worker_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_throughput");
    let size = 256u64;
    group.throughput(Throughput::Elements(size));

    group.bench_function("sequential", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for n in 0..size {
                acc ^= busy_work(black_box(n));
            }
            acc
        })
    });

    for num_workers in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("workers", num_workers),
            &num_workers,
            |b, &num_workers| {
                b.iter(|| {
                    let stream = map(
                        0..size,
                        |n: u64| [Ok::<_, String>(busy_work(n))],
                        MapConfig::new().with_num_workers(num_workers),
                    )
                    .unwrap();
                    stream
                        .map(|entry| entry.unwrap().value)
                        .fold(0u64, |acc, v| acc ^ black_box(v))
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_worker_sweep);
criterion_main!(benches);
