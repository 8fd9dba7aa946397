#![allow(clippy::unwrap_used)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hibernate::Task;
use std::time::Duration;

mod common;
use common::flows::{ChainBench, PayloadBench};
use common::setup::{BenchContext, drive_chain};

/// Benchmark: Cost of a chain of suspensions, each one a dehydrate/hydrate cycle
fn bench_suspension_chain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("suspension_chain");
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(20);

    for steps in [10u32, 50, 100] {
        group.throughput(Throughput::Elements(steps as u64));
        group.bench_with_input(BenchmarkId::new("steps", steps), &steps, |b, &steps| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let mut total_time = Duration::ZERO;

                    for _ in 0..iters {
                        let ctx = BenchContext::new();

                        let start = std::time::Instant::now();
                        let started = ctx
                            .engine
                            .start(Task::from_continuation(ChainBench::new(steps)))
                            .await
                            .unwrap();
                        let resumes = drive_chain(&ctx.engine, started, 1).await;
                        total_time += start.elapsed();

                        assert_eq!(resumes, steps as usize);
                    }

                    total_time
                })
            });
        });
    }

    group.finish();
}

/// Benchmark: Hydration from a second engine (no shared in-process state)
fn bench_cross_engine_resume(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("cross_engine_resume");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("single_frame", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let ctx = BenchContext::new();
                let peer = ctx.peer();

                let mut steps = Vec::with_capacity(iters as usize);
                for _ in 0..iters {
                    let started = ctx
                        .engine
                        .start(Task::from_continuation(ChainBench::new(1)))
                        .await
                        .unwrap();
                    steps.push(started.pending()[0]);
                }

                let start = std::time::Instant::now();
                for step in steps {
                    peer.resume_with(step, &1u64).await.unwrap();
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark: Frames carrying large user fields
fn bench_large_payload_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("large_payload_frame");
    group.measurement_time(Duration::from_secs(20));
    group.sample_size(10);

    // 1KB, 100KB, 1MB payloads
    for size in [1_000usize, 100_000, 1_000_000] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("bytes", size), &size, |b, &size| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let mut total_time = Duration::ZERO;

                    for _ in 0..iters {
                        let ctx = BenchContext::new();

                        let start = std::time::Instant::now();
                        let started = ctx
                            .engine
                            .start(Task::from_continuation(PayloadBench::new(size)))
                            .await
                            .unwrap();
                        let result = ctx
                            .engine
                            .resume_with(started.pending()[0], &0u64)
                            .await
                            .unwrap();
                        total_time += start.elapsed();

                        assert!(result.outcome().is_some());
                    }

                    total_time
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_suspension_chain,
    bench_cross_engine_resume,
    bench_large_payload_frame
);
criterion_main!(benches);
