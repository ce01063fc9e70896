//! Hot-path benchmarks: decoding records and applying them to the state store.
//!
//! Run with: `cargo bench -p tally-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tally_core::{
    AggregateDelta, DiscardDeadLetters, MerchantId, OffsetMark, SourceRecord, TransactionEvent,
    codec,
};
use tally_runtime::{AggregateStore, AggregationEngine};
use tally_testing::transaction;

const MERCHANTS: usize = 1_000;

fn records(count: usize) -> Vec<SourceRecord> {
    (0..count)
        .map(|i| {
            let merchant = format!("merchant_{}", i % MERCHANTS);
            let offset = i64::try_from(i).expect("offset fits");
            SourceRecord::new(0, offset, transaction(&merchant, 12.34))
        })
        .collect()
}

fn events(count: usize) -> Vec<TransactionEvent> {
    records(count)
        .iter()
        .map(|record| codec::parse(record).expect("fixture parses"))
        .collect()
}

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    let record = records(1).remove(0);
    group.bench_function("parse", |b| {
        b.iter(|| codec::parse(black_box(&record)));
    });

    group.finish();
}

fn benchmark_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Elements(1));

    let store = AggregateStore::new();
    let merchant = MerchantId::new("merchant_0");
    let delta = AggregateDelta {
        amount: "12.34".parse().expect("decimal"),
        count: 1,
    };
    group.bench_function("apply_existing_merchant", |b| {
        b.iter(|| store.apply(black_box(&merchant), delta, OffsetMark::new(1)));
    });

    let populated = AggregateStore::new();
    for event in events(MERCHANTS) {
        populated
            .apply(&event.merchant_id, AggregateDelta::for_event(&event), OffsetMark::new(1))
            .expect("no overflow");
    }
    group.bench_function("snapshot_1k_merchants", |b| {
        b.iter(|| black_box(populated.snapshot()));
    });

    group.finish();
}

fn benchmark_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    let batch = events(10_000);
    group.throughput(Throughput::Elements(u64::try_from(batch.len()).expect("fits")));

    group.bench_function("process_batch_10k", |b| {
        b.iter_batched(
            || {
                AggregationEngine::new(
                    Arc::new(AggregateStore::new()),
                    Arc::new(DiscardDeadLetters),
                )
            },
            |engine| engine.process_batch(black_box(&batch), OffsetMark::new(1)),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, benchmark_codec, benchmark_store, benchmark_engine);
criterion_main!(benches);
