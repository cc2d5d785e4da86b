//! Criterion micro-benchmarks for equivalence-set lookup and refinement.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use weft_core::{DistributedId, FieldMask, NodeId};
use weft_eqset::{EqKDRoot, EquivalenceSet, Rect};

fn factory() -> impl FnMut(&Rect) -> Arc<EquivalenceSet> {
    let mut next = 0u64;
    move |bounds: &Rect| {
        next += 1;
        Arc::new(EquivalenceSet::new(DistributedId(next), NodeId(0), bounds.clone()))
    }
}

/// Benchmark: refine 64 adjacent strips of a 4,096-point line.
fn bench_refine_strips(c: &mut Criterion) {
    let mask = FieldMask::first_n(4);
    c.bench_function("eqset_refine_64_strips", |b| {
        b.iter(|| {
            let root = EqKDRoot::new(Rect::line(0, 4095));
            let mut f = factory();
            for i in 0..64 {
                let q = Rect::line(i * 64, i * 64 + 63);
                black_box(root.refine(&q, &mask, &mut f));
            }
        });
    });
}

/// Benchmark: full-range lookup over an already refined tree.
fn bench_compute_refined(c: &mut Criterion) {
    let mask = FieldMask::first_n(4);
    let root = EqKDRoot::new(Rect::line(0, 4095));
    let mut f = factory();
    for i in 0..64 {
        root.refine(&Rect::line(i * 64, i * 64 + 63), &mask, &mut f);
    }
    let all = Rect::line(0, 4095);
    c.bench_function("eqset_compute_refined_tree", |b| {
        b.iter(|| black_box(root.compute(&all, &mask, &mut f).local.len()));
    });
}

criterion_group!(benches, bench_refine_strips, bench_compute_refined);
criterion_main!(benches);
