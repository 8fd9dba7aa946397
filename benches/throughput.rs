#![allow(clippy::unwrap_used)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hibernate::Task;
use std::time::Duration;

mod common;
use common::flows::{ChainBench, FanBench, YieldBench};
use common::setup::{BenchContext, bench_reminder_options, wait_for_flows_complete};

/// Benchmark: Start latency (how long to persist a single suspended flow)
fn bench_start_latency(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("start_latency");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("single_start", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let ctx = BenchContext::new();

                let start = std::time::Instant::now();
                for _ in 0..iters {
                    ctx.engine
                        .start(Task::from_continuation(ChainBench::new(1)))
                        .await
                        .unwrap();
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark: when_all fan-in with varying widths
fn bench_fan_in(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("fan_in");
    group.measurement_time(Duration::from_secs(20));
    group.sample_size(10);

    for width in [4u32, 16, 64] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("width", width), &width, |b, &width| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let mut total_time = Duration::ZERO;

                    for _ in 0..iters {
                        let ctx = BenchContext::new();

                        let start = std::time::Instant::now();
                        let started = ctx
                            .engine
                            .start(Task::from_continuation(FanBench { state: 0, width }))
                            .await
                            .unwrap();
                        // Leaves are persisted before their aggregator.
                        let leaves = started.pending()[..width as usize].to_vec();
                        let mut last = None;
                        for step in leaves {
                            last = Some(ctx.engine.resume_with(step, &1u64).await.unwrap());
                        }
                        total_time += start.elapsed();

                        assert!(last.and_then(|r| r.outcome().cloned()).is_some());
                    }

                    total_time
                })
            });
        });
    }

    group.finish();
}

/// Benchmark: End-to-end completion through the reminder worker
fn bench_reminder_delivery(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("reminder_delivery");
    group.measurement_time(Duration::from_secs(30));
    group.sample_size(10);

    for concurrency in [1usize, 4, 8] {
        let num_flows: u32 = 50;

        group.throughput(Throughput::Elements(num_flows as u64));
        group.bench_with_input(
            BenchmarkId::new("workers", concurrency),
            &(num_flows, concurrency),
            |b, &(num_flows, concurrency)| {
                b.iter_custom(|iters| {
                    rt.block_on(async {
                        let mut total_time = Duration::ZERO;

                        for _ in 0..iters {
                            let ctx = BenchContext::new();

                            let mut flows = Vec::with_capacity(num_flows as usize);
                            for _ in 0..num_flows {
                                let started = ctx
                                    .engine
                                    .start(Task::from_continuation(YieldBench {
                                        state: 0,
                                        remaining: 2,
                                    }))
                                    .await
                                    .unwrap();
                                flows.push(started.flow_id());
                            }

                            let start = std::time::Instant::now();
                            let worker = ctx
                                .engine
                                .start_reminder_worker(bench_reminder_options(concurrency));
                            wait_for_flows_complete(&ctx.engine, &flows, 60).await;
                            total_time += start.elapsed();

                            worker.shutdown().await;
                        }

                        total_time
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_start_latency,
    bench_fan_in,
    bench_reminder_delivery
);
criterion_main!(benches);
