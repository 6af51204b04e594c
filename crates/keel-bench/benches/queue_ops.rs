//! Criterion micro-benchmarks for the bounded MPMC queue and the job
//! system dispatch path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use keel::sched::BoundedQueue;
use keel::{JobSystem, SchedConfig};

/// Benchmark: uncontended enqueue/dequeue pairs.
fn bench_queue_pair(c: &mut Criterion) {
    let queue = BoundedQueue::new(1024);
    c.bench_function("queue_enqueue_dequeue", |b| {
        b.iter(|| {
            queue.enqueue(black_box(7u32)).unwrap();
            black_box(queue.dequeue().unwrap());
        });
    });
}

/// Benchmark: the single-threaded variants, for the protocol overhead
/// delta.
fn bench_queue_pair_unsync(c: &mut Criterion) {
    let mut queue = BoundedQueue::new(1024);
    c.bench_function("queue_enqueue_dequeue_unsync", |b| {
        b.iter(|| {
            queue.enqueue_unsync(black_box(7u32)).unwrap();
            black_box(queue.dequeue_unsync().unwrap());
        });
    });
}

/// Benchmark: schedule-and-flush batches of trivial jobs on the calling
/// thread (no workers), measuring pure scheduling overhead.
fn bench_schedule_flush(c: &mut Criterion) {
    let jobs = JobSystem::new(SchedConfig::default()).unwrap();
    let mut group = c.benchmark_group("job_schedule_flush");
    group.throughput(Throughput::Elements(256));
    group.bench_function("256_trivial_jobs", |b| {
        let hits = Arc::new(AtomicUsize::new(0));
        b.iter(|| {
            for _ in 0..256 {
                let h = Arc::clone(&hits);
                jobs.schedule(h, |_, h: &mut Arc<AtomicUsize>| {
                    h.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
            jobs.flush().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_queue_pair, bench_queue_pair_unsync, bench_schedule_flush);
criterion_main!(benches);
