//! Benchmarks for the deferred execution engine.
//!
//! Benchmarks cover:
//! - Work queue submit and flush, dedicated and shared
//! - Tasklet scheduling across both tiers
//! - Registry allocation and teardown

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prometheus_deferred::config::WorkQueueConfig;
use prometheus_deferred::core::{
    RunQueue, SharedWorkerPool, TaskRegistry, Tasklet, Tier, WorkItem, WorkQueue,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn counting_items(n: u64, counter: &Arc<AtomicUsize>) -> Vec<WorkItem> {
    (0..n)
        .map(|i| {
            let c = Arc::clone(counter);
            WorkItem::new(format!("bench-{i}"), move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
        .collect()
}

fn spin_until(counter: &AtomicUsize, target: usize) {
    while counter.load(Ordering::Relaxed) < target {
        std::hint::spin_loop();
    }
}

// ============================================================================
// Work Queue Benchmarks
// ============================================================================

fn bench_dedicated_submit_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedicated_submit_flush");

    for size in [100_u64, 1_000] {
        let wq = WorkQueue::create(WorkQueueConfig::dedicated("bench-dedicated", 2), None, None)
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let items = counting_items(size, &counter);

        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| {
                for item in items {
                    black_box(wq.submit(item).unwrap());
                }
                wq.flush().unwrap();
            });
        });
        wq.destroy().unwrap();
    }
    group.finish();
}

fn bench_shared_submit_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_submit_flush");
    let pool = SharedWorkerPool::start(4).unwrap();

    for size in [100_u64, 1_000] {
        let wq = WorkQueue::create(WorkQueueConfig::shared("bench-shared"), Some(&pool), None)
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let items = counting_items(size, &counter);

        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &items, |b, items| {
            b.iter(|| {
                for item in items {
                    black_box(wq.submit(item).unwrap());
                }
                wq.flush().unwrap();
            });
        });
        wq.destroy().unwrap();
    }
    pool.shutdown();
    group.finish();
}

// ============================================================================
// Tasklet Benchmarks
// ============================================================================

fn bench_tasklet_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("tasklet_schedule");
    let rq = RunQueue::start(2, None).unwrap();

    for size in [100_u64, 1_000] {
        let counter = Arc::new(AtomicUsize::new(0));
        let tasklets: Vec<_> = (0..size)
            .map(|i| {
                let c = Arc::clone(&counter);
                Tasklet::new(&rq, format!("bench-{i}"), move |_| {
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            })
            .collect();

        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &tasklets, |b, tasklets| {
            b.iter(|| {
                let target = counter.load(Ordering::Relaxed) + tasklets.len();
                for (i, t) in tasklets.iter().enumerate() {
                    let tier = if i % 4 == 0 { Tier::High } else { Tier::Normal };
                    black_box(t.schedule_on(tier).unwrap());
                }
                spin_until(&counter, target);
            });
        });

        for t in &tasklets {
            t.kill().unwrap();
        }
    }
    rq.shutdown();
    group.finish();
}

// ============================================================================
// Registry Benchmarks
// ============================================================================

fn bench_registry_create_teardown(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_create_teardown");
    let rq = RunQueue::start(2, None).unwrap();

    for size in [64_u64, 512] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let registry =
                    TaskRegistry::new("bench", &rq, size as usize, true, |_, p: &u64| {
                        black_box(*p);
                        Ok(())
                    });
                for i in 0..size {
                    black_box(registry.create_tracked(i, i % 8 == 0).unwrap());
                }
                registry.teardown().unwrap();
            });
        });
    }
    rq.shutdown();
    group.finish();
}

criterion_group!(
    queue_benches,
    bench_dedicated_submit_flush,
    bench_shared_submit_flush
);

criterion_group!(tasklet_benches, bench_tasklet_schedule);

criterion_group!(registry_benches, bench_registry_create_teardown);

criterion_main!(queue_benches, tasklet_benches, registry_benches);
