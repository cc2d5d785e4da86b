//! End-to-end scenarios: bulk issue, racing deletions, replicated fence
//! barriers, buffered collectives and window back-pressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use weft_context::{
    ContextConfig, Deliver, DeletionOutcome, Delivery, InnerContext, Message, ResourceOwner,
    Resource, ShardManager, ReplicationConfig, TaskContext,
};
use weft_core::{CollectiveId, ShardId};
use weft_eqset::Rect;
use weft_pipeline::OpKind;
use weft_test_utils::fixtures::{manual_runtime, pooled_runtime, recording_runtime, region, write};
use weft_test_utils::shards::ShardHarness;
use weft_test_utils::{init_test_logging, GatedOp};

fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

// ── Bulk issue ─────────────────────────────────────────────────────

#[test]
fn thousand_fills_commit_and_drain() {
    init_test_logging();
    let (sched, rt) = manual_runtime(ContextConfig::default());
    let ctx = InnerContext::root(rt).unwrap();
    let r = region(ctx.as_ref(), Rect::line(0, 255), 2).unwrap();

    for i in 0..1000u32 {
        let req = write(r, 1 + i % 2);
        ctx.fill_fields(req, &i.to_le_bytes()).unwrap();
    }
    assert_eq!(ctx.total_children(), 1000);
    sched.run_until_idle();

    let m = ctx.metrics();
    assert_eq!(m.issued, 1000);
    assert_eq!(m.committed, 1000);
    assert_eq!(m.poisoned, 0);
    assert_eq!(ctx.outstanding_children_count(), 0);
    assert_eq!(ctx.reorder_buffer_len(), 0);
    assert!(!ctx.is_window_blocked());
}

// ── Racing deletions ───────────────────────────────────────────────

#[test]
fn racing_deletions_destroy_once_after_both_users() {
    init_test_logging();
    let (sched, forest, rt) = recording_runtime(ContextConfig::default());
    let ctx = InnerContext::root(rt).unwrap();
    let r = region(ctx.as_ref(), Rect::line(0, 63), 2).unwrap();
    let fs = Resource::FieldSpace(r.field_space);
    assert_eq!(ctx.create_shared_ownership(fs).unwrap(), 2);

    let first = GatedOp::new();
    let second = GatedOp::new();
    let h1 = ctx
        .issue_operation(first.spec(OpKind::Copy, &[write(r, 1)]))
        .unwrap();
    let h2 = ctx
        .issue_operation(second.spec(OpKind::Copy, &[write(r, 2)]))
        .unwrap();
    forest.watch(h1.completed.clone());
    forest.watch(h2.completed.clone());

    let outcomes: Vec<DeletionOutcome> = thread::scope(|s| {
        let a = s.spawn(|| ctx.destroy_field_space(r.field_space).unwrap());
        let b = s.spawn(|| ctx.destroy_field_space(r.field_space).unwrap());
        vec![a.join().unwrap(), b.join().unwrap()]
    });
    let deferred = outcomes
        .iter()
        .filter(|o| matches!(o, DeletionOutcome::Deferred { remaining: 1 }))
        .count();
    let destroying = outcomes
        .iter()
        .filter(|o| matches!(o, DeletionOutcome::Destroying(_)))
        .count();
    assert_eq!((deferred, destroying), (1, 1));

    sched.run_until_idle();
    assert_eq!(forest.destroy_count(&fs), 0);

    first.open();
    sched.run_until_idle();
    assert_eq!(forest.destroy_count(&fs), 0);

    second.open();
    sched.run_until_idle();
    assert_eq!(forest.destroy_count(&fs), 1);
    let record = forest
        .records()
        .into_iter()
        .find(|rec| rec.resource == fs)
        .unwrap();
    assert!(record.after_watched);
    assert!(!ctx.owns(&fs));
}

// ── Replicated fence barriers ──────────────────────────────────────

#[test]
fn four_shards_draw_identical_fence_barriers() {
    init_test_logging();
    let harness = ShardHarness::launch(4, Vec::new());
    let sequences = harness.on_every_shard(|ctx| {
        (0..16)
            .map(|i| {
                if i % 4 == 3 {
                    ctx.get_next_mapping_fence_barrier().unwrap()
                } else {
                    ctx.get_next_execution_fence_barrier().unwrap()
                }
            })
            .collect::<Vec<_>>()
    });
    for seq in &sequences[1..] {
        assert_eq!(seq, &sequences[0]);
    }
    let fences: Vec<_> = sequences[0].iter().step_by(4).collect();
    assert!(fences.windows(2).all(|w| w[0] != w[1]));
}

// ── Buffered collectives ───────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(ShardId, Vec<u8>)>>,
}

impl Deliver<(ShardId, Vec<u8>)> for Recorder {
    fn deliver(&self, payload: (ShardId, Vec<u8>)) {
        self.seen.lock().push(payload);
    }
}

#[test]
fn early_collective_is_buffered_then_replayed_in_order() {
    init_test_logging();
    let rt = pooled_runtime(ContextConfig::default(), 1);
    let manager = ShardManager::new(rt, ReplicationConfig::shard(ShardId(0), 3)).unwrap();
    let target = ShardId(2);
    let seven = CollectiveId(7);
    for (from, byte) in [(0u32, 1u8), (1, 2), (0, 3)] {
        manager
            .send(
                target,
                Message::Collective {
                    collective: seven,
                    from: ShardId(from),
                    payload: vec![byte],
                },
            )
            .unwrap();
    }
    let registry = manager.collectives(target).unwrap();
    assert_eq!(registry.pending_len(&seven), 3);
    assert_eq!(manager.metrics(target).unwrap().snapshot().buffered_messages, 3);

    let recorder = Arc::new(Recorder::default());
    let replayed = registry.register(seven, recorder.clone()).unwrap();
    assert_eq!(replayed, 3);
    assert_eq!(registry.pending_len(&seven), 0);
    assert_eq!(
        *recorder.seen.lock(),
        vec![
            (ShardId(0), vec![1]),
            (ShardId(1), vec![2]),
            (ShardId(0), vec![3]),
        ]
    );

    let late = registry.find_or_buffer(seven, (ShardId(1), vec![4])).unwrap();
    assert_eq!(late, Delivery::Delivered);
    assert_eq!(recorder.seen.lock().len(), 4);
}

// ── Window back-pressure ───────────────────────────────────────────

#[test]
fn full_window_blocks_until_hysteresis_point() {
    init_test_logging();
    let config = ContextConfig {
        max_window_size: 100,
        hysteresis_percentage: 50,
        ..ContextConfig::default()
    };
    let rt = pooled_runtime(config, 2);
    let ctx = InnerContext::root(rt).unwrap();
    let gates: Vec<GatedOp> = (0..150).map(|_| GatedOp::new()).collect();
    let issued = AtomicUsize::new(0);

    thread::scope(|s| {
        let issuer = s.spawn(|| {
            for gate in &gates {
                ctx.issue_operation(gate.spec(OpKind::Copy, &[])).unwrap();
                issued.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(eventually(|| issued.load(Ordering::SeqCst) == 100
            && ctx.is_window_blocked()));

        for gate in &gates[..49] {
            gate.open();
        }
        assert!(eventually(|| ctx.outstanding_children_count() == 51));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(issued.load(Ordering::SeqCst), 100);
        assert!(ctx.is_window_blocked());

        gates[49].open();
        assert!(eventually(|| issued.load(Ordering::SeqCst) > 100));

        for gate in &gates[50..] {
            gate.open();
        }
        issuer.join().unwrap();
    });

    assert_eq!(issued.load(Ordering::SeqCst), 150);
    assert!(eventually(|| ctx.outstanding_children_count() == 0));
    assert!(ctx.metrics().window_waits >= 1);
}
