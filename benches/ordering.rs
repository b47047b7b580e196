//! Benchmarks for the cost of ordered delivery and the look-ahead window

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use scatter::{MapConfig, OrderPolicy, map};
use std::hint::black_box;

fn busy_work(seed: u64) -> u64 {
    let mut x = seed.wrapping_add(0x9e3779b97f4a7c15);
    // uneven cost per item so ordered mode actually reorders
    for _ in 0..(500 + (seed % 7) * 500) {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
    }
    x
}

fn run(config: MapConfig) -> u64 {
    let stream = map(0..256u64, |n: u64| [Ok::<_, String>(busy_work(n))], config).unwrap();
    stream
        .map(|entry| entry.unwrap().value)
        .fold(0u64, |acc, v| acc ^ black_box(v))
}

fn bench_order_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_policy");
    group.throughput(Throughput::Elements(256));

    group.bench_function("unordered", |b| {
        b.iter(|| run(MapConfig::new().with_num_workers(4)))
    });
    group.bench_function("ordered", |b| {
        b.iter(|| {
            run(MapConfig::new()
                .with_num_workers(4)
                .with_order(OrderPolicy::Ordered))
        })
    });

    group.finish();
}

fn bench_max_ahead_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_max_ahead");
    group.throughput(Throughput::Elements(256));

    for max_ahead in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_ahead),
            &max_ahead,
            |b, &max_ahead| {
                b.iter(|| {
                    run(MapConfig::new()
                        .with_num_workers(4)
                        .with_order(OrderPolicy::Ordered)
                        .with_max_ahead(max_ahead))
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_order_policies, bench_max_ahead_sweep);
criterion_main!(benches);
