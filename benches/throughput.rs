use criterion::{criterion_group, criterion_main, Criterion};

use reclaim_queue::reclaim::{Epoch, Hazard, Leak, Reclaim};
use reclaim_queue::{MpmcQueue, MutexQueue};

fn ping<R: Reclaim>(queue: &MpmcQueue<u64, R>) {
    queue.push(1).unwrap();
    queue.pop().unwrap();
}

fn uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_push_pop");

    let leak: MpmcQueue<u64, Leak> = MpmcQueue::new();
    group.bench_function("leak", |b| b.iter(|| ping(&leak)));

    let hazard: MpmcQueue<u64, Hazard> = MpmcQueue::new();
    group.bench_function("hazard", |b| b.iter(|| ping(&hazard)));

    let epoch: MpmcQueue<u64, Epoch> = MpmcQueue::new();
    group.bench_function("epoch", |b| b.iter(|| ping(&epoch)));

    let mutex: MutexQueue<u64> = MutexQueue::new();
    group.bench_function("mutex", |b| {
        b.iter(|| {
            mutex.push(1).unwrap();
            mutex.pop().unwrap();
        })
    });

    group.finish();
}

fn batch<R: Reclaim>(queue: &MpmcQueue<u64, R>, n: u64) {
    for i in 0..n {
        queue.push(i).unwrap();
    }
    for _ in 0..n {
        queue.pop().unwrap();
    }
}

fn batched(c: &mut Criterion) {
    const N: u64 = 1_000;
    let mut group = c.benchmark_group("batch_1000");
    group.throughput(criterion::Throughput::Elements(N));

    let hazard: MpmcQueue<u64, Hazard> = MpmcQueue::new();
    group.bench_function("hazard", |b| b.iter(|| batch(&hazard, N)));

    let epoch: MpmcQueue<u64, Epoch> = MpmcQueue::new();
    group.bench_function("epoch", |b| b.iter(|| batch(&epoch, N)));

    group.finish();
}

criterion_group!(benches, uncontended, batched);
criterion_main!(benches);
