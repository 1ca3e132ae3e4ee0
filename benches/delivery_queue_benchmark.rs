use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use ds::{Priority, Shipment};
use rand::Rng;

use station_client::{
    freshness::{FreshnessKey, FreshnessRegistry},
    DeliveryQueue, EntityId, MessageRef, RetryPolicy,
};

const PRIORITIES: [Priority; 3] = [Priority::HANDSHAKE, Priority::DEFAULT, Priority::BROADCAST];

fn filled_queue(n: usize) -> DeliveryQueue {
    let queue = DeliveryQueue::new(RetryPolicy::new(
        3,
        Duration::from_secs(2),
        Duration::from_secs(600),
    ));
    let alice = EntityId::user("alice", "moky");
    let bob = EntityId::user("bob", "moky");
    let mut rng = rand::thread_rng();
    for sn in 0..n as u64 {
        let message = MessageRef::new(&alice, &bob, sn);
        let priority = PRIORITIES[rng.gen_range(0..PRIORITIES.len())];
        let shipment = Shipment::new(vec![0u8; 256], priority, Some(&message.id));
        queue.append(message, shipment, 0);
    }
    queue
}

fn append_benchmark(c: &mut Criterion) {
    for n in [100, 1000, 10000] {
        c.bench_function(format!("delivery_queue_append_{}", n).as_str(), |b| {
            b.iter(|| filled_queue(n))
        });
    }
}

fn drain_benchmark(c: &mut Criterion) {
    for n in [100, 1000, 10000] {
        c.bench_function(format!("delivery_queue_drain_{}", n).as_str(), |b| {
            b.iter_batched(
                || filled_queue(n),
                |queue| {
                    while let Some(entry) = queue.next(1) {
                        queue.complete(&entry);
                    }
                },
                BatchSize::LargeInput,
            )
        });
    }
}

fn purge_benchmark(c: &mut Criterion) {
    for n in [1000, 10000] {
        c.bench_function(format!("delivery_queue_purge_{}", n).as_str(), |b| {
            b.iter_batched(
                || filled_queue(n),
                |queue| queue.purge(Duration::from_secs(601).as_millis() as u64),
                BatchSize::LargeInput,
            )
        });
    }
}

fn freshness_benchmark(c: &mut Criterion) {
    let registry = FreshnessRegistry::new(Duration::from_secs(600));
    let keys: Vec<FreshnessKey> = (0..1000)
        .map(|i| FreshnessKey::meta(&EntityId::user(&format!("user{i}"), "moky")))
        .collect();
    c.bench_function("freshness_should_query_1000_keys", |b| {
        let mut now = 0u64;
        b.iter(|| {
            now += 1;
            for key in &keys {
                registry.should_query(key, now, false);
            }
        })
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(10);
    targets =
        append_benchmark,
        drain_benchmark,
        purge_benchmark,
        freshness_benchmark
);
criterion_main!(benches);
