//! Scheduling tick cost over large pending queues.
//!
//! Measures:
//! - Queue ordering (fair-share score, pins, tie-breaks)
//! - A full tick against a small cluster that can only take a handful of tasks
//! - A tick at night, where LOW tasks become backfill candidates

use chrono::NaiveTime;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use labgpu::core::gpu::{Gpu, Node};
use labgpu::core::policy::SchedulerPolicy;
use labgpu::core::scheduler::Scheduler;
use labgpu::core::task::{Priority, Task};
use std::hint::black_box;
use std::time::Duration;

const PRIORITIES: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

fn create_test_task(index: u32) -> Task {
    Task::builder()
        .id(index + 1)
        .user(format!("user{}", index % 50))
        .cmd(format!("python train.py --seed {}", index % 100))
        .min_vram_gb(((index % 8) + 1) as f64 * 4.0)
        .priority(PRIORITIES[index as usize % PRIORITIES.len()])
        .time_limit((index % 3 == 0).then(|| Duration::from_secs(600)))
        .build()
}

fn populate_scheduler(size: u32) -> Scheduler {
    let mut scheduler = Scheduler::new(SchedulerPolicy::default());
    for i in 0..size {
        let _ = scheduler.submit(create_test_task(i));
    }
    scheduler
}

fn create_cluster() -> Vec<Node> {
    (0..4)
        .map(|n| {
            let gpus = (0..8).map(|g| Gpu::new(g, 80.0)).collect();
            Node::new(format!("node-{n}"), gpus)
        })
        .collect()
}

fn noon() -> NaiveTime {
    NaiveTime::from_hms_opt(12, 0, 0).unwrap()
}

fn bench_pending_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/pending_order");
    group.sample_size(10);

    for size in [1_000, 10_000, 50_000] {
        let scheduler = populate_scheduler(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("tasks", size), &scheduler, |b, scheduler| {
            b.iter(|| black_box(scheduler.pending_order_at(noon()).len()));
        });
    }

    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/tick");
    group.sample_size(10);

    for (label, now) in [("day", noon()), ("night", NaiveTime::from_hms_opt(3, 0, 0).unwrap())] {
        for size in [1_000, 10_000, 50_000] {
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, &size| {
                b.iter_batched(
                    || (populate_scheduler(size), create_cluster()),
                    |(mut scheduler, mut nodes)| {
                        black_box(scheduler.schedule_at(&mut nodes, now).len())
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_pending_order, bench_tick);
criterion_main!(benches);
