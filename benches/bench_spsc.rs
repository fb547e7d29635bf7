//! SPSC ring hot-path benchmarks

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use synapse::fabric::{AgentId, Message, MessageType};
use synapse::spsc::SpscRing;

fn bench_enqueue_dequeue_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_u64");
    group.throughput(Throughput::Elements(1));
    group.bench_function("enqueue_dequeue", |b| {
        let ring = SpscRing::with_capacity(1024).unwrap();
        let mut value = 0u64;
        b.iter(|| {
            value = value.wrapping_add(1);
            ring.try_enqueue(value).unwrap();
            ring.try_dequeue().unwrap()
        });
    });
    group.finish();
}

fn bench_enqueue_dequeue_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_message");
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("enqueue_dequeue_4k", |b| {
        let ring = SpscRing::with_capacity(256).unwrap();
        let message = Message::new(
            AgentId::SYSTEM_ARCHITECT,
            AgentId::SIMULATION_ENGINEER,
            MessageType::SimulationState,
            &[0xAB; 1024],
        )
        .unwrap();
        b.iter_batched(
            || message,
            |m| {
                ring.try_enqueue(m).unwrap();
                ring.try_dequeue().unwrap()
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue_dequeue_u64, bench_enqueue_dequeue_message);
criterion_main!(benches);
