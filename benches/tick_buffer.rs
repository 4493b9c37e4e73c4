//! Benchmarks for the sparse tick log.
//!
//! Run with: cargo bench --bench tick_buffer

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_flow::__internal::TickBuffer;
use lockstep_flow::{Age, Event, EventKind, ExecutionMode, Tick, TickBufferConfig, TickList};

fn payload_tick(age: i64) -> Tick {
    Tick::new(Age::new(age)).with_events(vec![Event::new(EventKind::Message {
        data: vec![age as u8],
    })])
}

/// Ticks `[0, len)` with a payload on every `every`-th age.
fn sparse_list(len: i64, every: i64) -> TickList {
    let ticks = (0..len).filter(|age| age % every == 0).map(payload_tick).collect();
    TickList::new(Age::new(0), Age::new(len), ticks)
}

fn bench_add_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("TickBuffer add_tick");

    for len in [100i64, 1_000].iter() {
        group.bench_with_input(BenchmarkId::new("in_order", len), len, |b, &len| {
            b.iter(|| {
                let mut buffer =
                    TickBuffer::new(TickBufferConfig::default(), ExecutionMode::Active);
                for age in 0..len {
                    buffer.add_tick(Tick::new(Age::new(age)));
                }
                black_box(buffer.nearest_absent_age())
            });
        });

        // Even ages first, then the odd ones fill the gaps and merge.
        group.bench_with_input(BenchmarkId::new("interleaved", len), len, |b, &len| {
            b.iter(|| {
                let mut buffer =
                    TickBuffer::new(TickBufferConfig::default(), ExecutionMode::Active);
                for age in (0..len).step_by(2).chain((1..len).step_by(2)) {
                    buffer.add_tick(Tick::new(Age::new(age)));
                }
                black_box(buffer.nearest_absent_age())
            });
        });
    }

    group.finish();
}

fn bench_add_tick_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("TickBuffer add_tick_list");

    for len in [600i64, 6_000].iter() {
        group.bench_with_input(BenchmarkId::new("sparse", len), len, |b, &len| {
            let list = sparse_list(len, 10);
            b.iter(|| {
                let mut buffer =
                    TickBuffer::new(TickBufferConfig::default(), ExecutionMode::Passive);
                black_box(buffer.add_tick_list(list.clone()))
            });
        });
    }

    group.finish();
}

fn bench_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("TickBuffer consume");

    group.bench_function("drain_600", |b| {
        let list = sparse_list(600, 10);
        b.iter(|| {
            let mut buffer = TickBuffer::new(TickBufferConfig::default(), ExecutionMode::Active);
            buffer.add_tick_list(list.clone());
            while let Some(tick) = buffer.consume() {
                black_box(tick);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_add_tick, bench_add_tick_list, bench_consume);
criterion_main!(benches);
