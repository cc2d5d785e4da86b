//! Criterion micro-benchmarks for issuing and retiring operations.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use weft_bench::{issue_fills, reference_config};
use weft_context::InnerContext;
use weft_core::ContextIndex;
use weft_eqset::Rect;
use weft_pipeline::{ChildStage, OpKind, OpRef, OpSpec, Operation, ReorderBuffer};
use weft_test_utils::fixtures::{manual_runtime, region};

/// Benchmark: issue 1,000 fills and drain them to commit.
fn bench_issue_and_drain_1k(c: &mut Criterion) {
    c.bench_function("issue_and_drain_1k_fills", |b| {
        b.iter_batched(
            || {
                let (sched, rt) = manual_runtime(reference_config());
                let ctx = InnerContext::root(rt).unwrap();
                let r = region(ctx.as_ref(), Rect::line(0, 1023), 3).unwrap();
                (sched, ctx, r)
            },
            |(sched, ctx, r)| {
                issue_fills(&ctx, r, 1000).unwrap();
                sched.run_until_idle();
                black_box(ctx.metrics().committed);
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark: commit 1,000 reorder-buffer entries in reverse and retire.
fn bench_reorder_reverse_commit(c: &mut Criterion) {
    let ops: Vec<_> = (0..1000u64)
        .map(|i| Operation::new(ContextIndex(i), OpSpec::new(OpKind::Fill)))
        .collect();

    c.bench_function("reorder_reverse_commit_1k", |b| {
        b.iter(|| {
            let mut rob = ReorderBuffer::new();
            for op in &ops {
                rob.insert(OpRef::new(op), op.index());
            }
            for op in ops.iter().rev() {
                rob.update(op.index(), ChildStage::Committed);
            }
            black_box(rob.retire().len());
        });
    });
}

criterion_group!(benches, bench_issue_and_drain_1k, bench_reorder_reverse_commit);
criterion_main!(benches);
