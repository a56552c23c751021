//! Benchmarks for the supervisor event loop using criterion.
//!
//! Workers come from the in-memory mock launcher, so these numbers measure
//! supervisor bookkeeping only:
//! - A full rolling restart over 10, 100 and 1000 workers
//! - A shutdown that drains every worker

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herd::{Supervisor, SupervisorConfig};
use herd_testkit::{mock_config, mock_supervisor, MockLauncher};

const WORKER_COUNTS: [usize; 3] = [10, 100, 1000];

fn bench_config(workers: usize) -> SupervisorConfig {
    mock_config(workers, Duration::from_secs(60))
}

async fn booted(workers: usize) -> Supervisor<MockLauncher> {
    let launcher = MockLauncher::obedient();
    let mut sup = mock_supervisor(bench_config(workers), &launcher);
    sup.start().await.expect("mock workers start");
    sup.process_pending().await;
    sup
}

fn bench_rolling_restart(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("rolling_restart");
    group.sample_size(20);

    for workers in WORKER_COUNTS {
        group.throughput(Throughput::Elements(workers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let mut sup = booted(workers).await;

                    let start = Instant::now();
                    sup.handle().reload().expect("queue open");
                    while sup.process_pending().await > 0 {}
                    total += start.elapsed();

                    assert!(!sup.sequencer().is_active());
                    assert_eq!(sup.workers().ready_count(), workers);
                }
                total
            });
        });
    }

    group.finish();
}

fn bench_shutdown(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("shutdown");
    group.sample_size(20);

    for workers in WORKER_COUNTS {
        group.throughput(Throughput::Elements(workers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let mut sup = booted(workers).await;

                    let start = Instant::now();
                    sup.handle().shutdown().expect("queue open");
                    sup.run().await.expect("shutdown completes");
                    total += start.elapsed();

                    assert!(sup.workers().is_empty());
                }
                total
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rolling_restart, bench_shutdown);
criterion_main!(benches);
