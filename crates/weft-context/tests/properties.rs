//! Property tests over whole contexts: issue order, retirement order,
//! resource return, equivalence-set exclusivity and barrier agreement
//! across shards.

use std::sync::Arc;

use proptest::prelude::*;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use weft_context::{
    BarrierTag, ContextConfig, InnerContext, ReplicationStrategy, Resource, ResourceOwner,
    TaskContext,
};
use weft_core::{ContextIndex, FieldMask};
use weft_eqset::Rect;
use weft_pipeline::OpKind;
use weft_test_utils::fixtures::{manual_runtime, region, write};
use weft_test_utils::shards::ShardHarness;
use weft_test_utils::GatedOp;

fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for i in (1..items.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

#[derive(Clone, Copy, Debug)]
enum Call {
    Fill(u32),
    Copy,
    MappingFence,
    ExecutionFence,
    Frame,
}

fn call() -> impl Strategy<Value = Call> {
    prop_oneof![
        4 => (1u32..3).prop_map(Call::Fill),
        2 => Just(Call::Copy),
        1 => Just(Call::MappingFence),
        1 => Just(Call::ExecutionFence),
        1 => Just(Call::Frame),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn operation_indices_strictly_increase(calls in prop::collection::vec(call(), 1..60)) {
        let (sched, rt) = manual_runtime(ContextConfig::default());
        let ctx = InnerContext::root(rt).unwrap();
        let r = region(ctx.as_ref(), Rect::line(0, 31), 2).unwrap();
        let mut last: Option<ContextIndex> = None;
        for (i, c) in calls.iter().enumerate() {
            let handle = match *c {
                Call::Fill(n) => ctx.fill_fields(write(r, n), &[i as u8]),
                Call::Copy => ctx.issue_copy(
                    weft_test_utils::fixtures::read(r, 1),
                    write(r, 2),
                ),
                Call::MappingFence => ctx.issue_mapping_fence(),
                Call::ExecutionFence => ctx.issue_execution_fence(),
                Call::Frame => {
                    sched.run_until_idle();
                    ctx.issue_frame()
                }
            }
            .unwrap();
            if let Some(prev) = last {
                prop_assert!(handle.index > prev);
            }
            last = Some(handle.index);
        }
        sched.run_until_idle();
        prop_assert_eq!(ctx.outstanding_children_count(), 0);
        prop_assert_eq!(ctx.metrics().committed, calls.len() as u64);
    }

    #[test]
    fn retirement_follows_issue_order(n in 1usize..40, seed in any::<u64>()) {
        let (sched, rt) = manual_runtime(ContextConfig::default());
        let ctx = InnerContext::root(rt).unwrap();
        let gates: Vec<GatedOp> = (0..n).map(|_| GatedOp::new()).collect();
        for gate in &gates {
            ctx.issue_operation(gate.spec(OpKind::Copy, &[])).unwrap();
        }
        sched.run_until_idle();
        let mut order: Vec<usize> = (0..n).collect();
        shuffle(&mut order, seed);
        let mut opened = vec![false; n];
        for i in order {
            gates[i].open();
            opened[i] = true;
            sched.run_until_idle();
            let prefix = opened.iter().take_while(|o| **o).count();
            prop_assert_eq!(ctx.reorder_buffer_len(), n - prefix);
        }
        prop_assert_eq!(ctx.metrics().committed, n as u64);
    }

    #[test]
    fn ended_child_returns_each_live_resource_once(
        spaces in 1usize..8,
        shares in prop::collection::vec(0u32..3, 8),
        deletes in prop::collection::vec(0u32..4, 8),
    ) {
        let (sched, rt) = manual_runtime(ContextConfig::default());
        let parent = InnerContext::root(rt).unwrap();
        let child = InnerContext::child(&parent, Vec::new(), Vec::new(), None).unwrap();
        let mut live = Vec::new();
        for i in 0..spaces {
            let fs = Resource::FieldSpace(child.create_field_space().unwrap());
            for _ in 0..shares[i] {
                child.create_shared_ownership(fs).unwrap();
            }
            let uses = shares[i] + 1;
            let dels = deletes[i].min(uses);
            for _ in 0..dels {
                child.delete_resource(fs).unwrap();
            }
            if dels < uses {
                live.push(fs);
            }
        }
        sched.run_until_idle();
        child.end_task().unwrap();
        sched.run_until_idle();
        for fs in &live {
            prop_assert!(parent.owns(fs));
            prop_assert!(!child.owns(fs));
        }
    }

    #[test]
    fn refined_sets_claim_each_point_and_field_once(
        queries in prop::collection::vec((0i64..48, 1i64..16, 1u32..4, any::<bool>()), 1..12),
    ) {
        let (_sched, rt) = manual_runtime(ContextConfig::default());
        let ctx = InnerContext::root(rt).unwrap();
        for (lo, len, fields, refine) in queries {
            let bounds = Rect::line(lo, (lo + len).min(63));
            let mask = FieldMask::first_n(fields);
            if refine {
                ctx.refine_equivalence_sets(0, &bounds, &mask).unwrap();
            } else {
                ctx.invalidate_equivalence_sets(0, &bounds, &mask);
            }
        }
        let all = ctx
            .find_equivalence_sets(0, &Rect::line(0, 63), &FieldMask::first_n(3))
            .unwrap()
            .wait()
            .unwrap();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                if a.set.did == b.set.did {
                    continue;
                }
                prop_assert!(
                    !(a.set.bounds.intersects(&b.set.bounds) && a.mask.overlaps(&b.mask)),
                    "{} and {} both claim a point and field",
                    a.set.did,
                    b.set.did
                );
            }
        }
    }

    #[test]
    fn every_pool_agrees_across_shards(shards in 1usize..5, draws in 1usize..10) {
        let harness = ShardHarness::launch(shards, Vec::new());
        let tags = [
            BarrierTag::MappingFence,
            BarrierTag::ExecutionFence,
            BarrierTag::ResourceReturn,
            BarrierTag::AttachDetach,
            BarrierTag::CloseMapped,
            BarrierTag::RefinementReady,
            BarrierTag::RefinementMapped,
            BarrierTag::CollectiveMap,
            BarrierTag::Indirection,
        ];
        let sequences: Vec<Vec<_>> = harness
            .shards
            .iter()
            .map(|ctx| {
                let strategy = Arc::clone(ctx.strategy());
                let mut seq = Vec::new();
                for _ in 0..draws {
                    for tag in tags {
                        if tag.is_paired() {
                            let (a, b) = strategy.next_pair(tag).unwrap();
                            seq.extend([a, b]);
                        } else {
                            seq.extend(strategy.barrier_for(tag).unwrap());
                        }
                    }
                }
                seq
            })
            .collect();
        for seq in &sequences[1..] {
            prop_assert_eq!(seq, &sequences[0]);
        }
    }
}
