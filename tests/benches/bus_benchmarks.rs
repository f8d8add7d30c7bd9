//! # Keel Benchmarks
//!
//! | Area | Operation | Target |
//! |------|-----------|--------|
//! | keel-bus | `accept` fan-out to 1..64 subscribers | < 10µs at 64 |
//! | keel-bus | persistent `accept` at full capacity | O(1) eviction |
//! | keel-kv | pipeline save / load through the mapper | < 1ms |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keel_bus::{consumer, ExceptionSink, MessageBus, PersistentBus};
use keel_kv::{InMemoryKvStore, ObjectMapper};
use keel_tests::fixtures::{sample_pipeline, Pipeline};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// keel-bus: dispatch
// ============================================================================

fn bench_accept_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("keel-bus-accept");
    group.measurement_time(Duration::from_secs(5));

    for subscribers in [1usize, 8, 64] {
        let bus = MessageBus::<u64>::new("bench", ExceptionSink::logging());
        let total = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..subscribers)
            .map(|_| {
                let total = total.clone();
                bus.open_subscription(consumer(move |m: &u64| {
                    total.fetch_add(*m, Ordering::Relaxed);
                    Ok(())
                }))
            })
            .collect();

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(BenchmarkId::new("fan_out", subscribers), &bus, |b, bus| {
            b.iter(|| bus.accept(black_box(1)))
        });
        drop(handles);
    }

    group.finish();
}

fn bench_persistent_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("keel-bus-history");

    for capacity in [16usize, 10_240] {
        let bus = PersistentBus::<u64>::new("bench", ExceptionSink::logging(), capacity);
        for i in 0..capacity as u64 {
            bus.accept(i);
        }
        group.bench_with_input(BenchmarkId::new("accept_full", capacity), &bus, |b, bus| {
            b.iter(|| bus.accept(black_box(7)))
        });
    }

    group.finish();
}

// ============================================================================
// keel-kv: mapping
// ============================================================================

fn bench_mapper(c: &mut Criterion) {
    let mut group = c.benchmark_group("keel-kv-mapper");
    let store = Arc::new(InMemoryKvStore::new());
    let mapper = ObjectMapper::<Pipeline>::new(store, "keel/pipelines").expect("mapper");
    let pipeline = sample_pipeline("web");
    mapper.save("web", &pipeline).expect("seed");

    group.bench_function("resave", |b| {
        b.iter(|| mapper.save("web", black_box(&pipeline)).expect("save"))
    });
    group.bench_function("load", |b| {
        b.iter(|| black_box(mapper.load("web").expect("load")))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_accept_fan_out,
    bench_persistent_eviction,
    bench_mapper
);
criterion_main!(benches);
