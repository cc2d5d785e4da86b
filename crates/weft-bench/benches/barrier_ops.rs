//! Criterion micro-benchmarks for replicated barrier pools and the
//! pending-message registry.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use weft_context::metrics::ContextMetrics;
use weft_context::replicate::barrier::{BarrierDirectory, PairedBarrierPool, RotatingPool};
use weft_context::{BarrierTag, Deliver, PendingRegistry};
use weft_core::{BarrierSubstrate, CollectiveId, ShardId};

fn directory(shards: usize) -> BarrierDirectory {
    BarrierDirectory::new(Arc::new(BarrierSubstrate::new(Default::default())), shards)
}

/// Benchmark: 1,000 draws from a rotating close-mapped pool of 4.
fn bench_rotating_pool(c: &mut Criterion) {
    c.bench_function("rotating_pool_1k_draws", |b| {
        b.iter(|| {
            let dir = directory(8);
            let mut pool = RotatingPool::replicate(BarrierTag::CloseMapped, 4);
            for _ in 0..1000 {
                black_box(pool.next(&dir).unwrap());
            }
        });
    });
}

/// Benchmark: 500 matched pairs from a collective-map pool.
fn bench_paired_pool(c: &mut Criterion) {
    let metrics = ContextMetrics::new();
    c.bench_function("paired_pool_500_pairs", |b| {
        b.iter(|| {
            let dir = directory(8);
            let mut pool = PairedBarrierPool::new(BarrierTag::CollectiveMap, 4);
            for _ in 0..500 {
                black_box(pool.next_pair(&dir, &metrics).unwrap());
            }
        });
    });
}

struct Sink;

impl Deliver<(ShardId, Vec<u8>)> for Sink {
    fn deliver(&self, payload: (ShardId, Vec<u8>)) {
        black_box(payload);
    }
}

/// Benchmark: buffer 256 early payloads, then register and replay them.
fn bench_registry_replay(c: &mut Criterion) {
    c.bench_function("registry_buffer_and_replay_256", |b| {
        b.iter(|| {
            let registry = PendingRegistry::new("collectives", 1024);
            for i in 0..256u32 {
                registry
                    .find_or_buffer(CollectiveId(7), (ShardId(i % 4), vec![0u8; 32]))
                    .unwrap();
            }
            black_box(registry.register(CollectiveId(7), Arc::new(Sink)).unwrap());
        });
    });
}

criterion_group!(benches, bench_rotating_pool, bench_paired_pool, bench_registry_replay);
criterion_main!(benches);
