use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, Utc};
use courier_core::{Data, Job, JobContext, JobId, JobSpec, Outcome};
use courier_infra::jobs::{ConstraintState, InMemoryJobStore, JobQueue, JobStore, QueueEntry};

struct Noop;

impl Job for Noop {
    fn factory_key(&self) -> &str {
        "noop"
    }

    fn serialize(&self) -> Data {
        Data::empty()
    }

    fn run(&mut self, _ctx: &JobContext) -> Outcome {
        Outcome::Success
    }
}

fn spec(i: usize) -> JobSpec {
    JobSpec::new("noop", Data::builder().put_long("seq", i as i64).build(), 3)
        .with_priority((i % 7) as i32)
}

/// Push `n` independent jobs with mixed priorities, then drain the queue.
fn bench_dispatch_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_dispatch");
    let state = ConstraintState::default();

    for n in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut queue = JobQueue::new();
                for i in 0..n {
                    queue.push(QueueEntry::new(&spec(i), Box::new(Noop)), []);
                }
                let later = Utc::now() + Duration::hours(1);
                while let Some(dispatch) = queue.take_next(later, &state) {
                    black_box(queue.complete(dispatch.id));
                }
            });
        });
    }

    group.finish();
}

/// A linear chain: every completion unblocks exactly one job.
fn bench_dependency_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_chain");
    let state = ConstraintState::default();

    for n in [100usize, 1_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut queue = JobQueue::new();
                let mut previous: Option<JobId> = None;
                for i in 0..n {
                    let spec = spec(i);
                    let id = spec.id;
                    queue.push(QueueEntry::new(&spec, Box::new(Noop)), previous);
                    previous = Some(id);
                }
                let later = Utc::now() + Duration::hours(1);
                while let Some(dispatch) = queue.take_next(later, &state) {
                    black_box(queue.complete(dispatch.id));
                }
            });
        });
    }

    group.finish();
}

/// Startup path: load a persisted snapshot in queue order.
fn bench_store_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_recovery");

    for n in [1_000usize, 10_000] {
        let store = InMemoryJobStore::new();
        let specs: Vec<JobSpec> = (0..n).map(spec).collect();
        if store.insert_all(&specs).is_err() {
            continue;
        }

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &store, |b, store| {
            b.iter(|| black_box(store.load_all_pending()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch_order,
    bench_dependency_chain,
    bench_store_recovery
);
criterion_main!(benches);
