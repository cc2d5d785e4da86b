//! Control replication.
//!
//! A replicated task runs the same body on every shard. Each shard drives
//! its own [`InnerContext`] with a [`ShardedStrategy`]; the shards stay in
//! lockstep through named barriers drawn in the same order everywhere and
//! through collectives keyed by index. A call that must happen once per
//! launch, such as running a child task or allocating an id, runs on one
//! shard and is broadcast to the others.

pub mod barrier;
pub mod collective;
pub mod shard;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use weft_core::{
    CollectiveId, ContextError, DistributedId, Event, FieldMask, NodeId, PhaseBarrier,
    ProtocolError, ShardId, TraceId,
};
use weft_eqset::{Rect, SetOverlap};
use weft_pipeline::{
    Execution, FnBehavior, Future, OpBehavior, OpKind, OpSpec, Operation, RegionRequirement,
};

use crate::context::{OpHandle, ReplicationStrategy, TaskContext};
use crate::inner::{InnerContext, InnerParams};
use crate::launcher::TaskLauncher;
use crate::runtime::Runtime;
use crate::trace::TraceOutcome;

use self::barrier::BarrierTag;
use self::collective::{
    consensus_match, decode_u64s, encode_u64s, exchange_template_updates, verify_replicable,
    ValueBroadcast,
};
use self::shard::{ShardManager, ShardedStrategy};

const RESULT_READY: u8 = 0;
const RESULT_POISONED: u8 = 1;

/// One shard of a control-replicated task.
pub struct ReplicateContext {
    inner: Arc<InnerContext>,
    strategy: Arc<ShardedStrategy>,
    manager: Arc<ShardManager>,
}

impl ReplicateContext {
    /// Context of `shard` in the launch managed by `manager`.
    pub fn new(
        manager: &Arc<ShardManager>,
        shard: ShardId,
        requirements: Vec<RegionRequirement>,
        args: Vec<u8>,
    ) -> Result<Arc<Self>, ContextError> {
        let metrics = manager
            .metrics(shard)
            .cloned()
            .ok_or(ContextError::Protocol(ProtocolError::Disconnected { shard }))?;
        let strategy = Arc::new(ShardedStrategy::new(shard, Arc::clone(manager)));
        let dyn_strategy: Arc<dyn ReplicationStrategy> = strategy.clone();
        let inner = InnerContext::new(InnerParams {
            runtime: Arc::clone(manager.runtime()),
            strategy: dyn_strategy,
            parent: None,
            depth: 0,
            requirements,
            args,
            point: None,
            metrics,
        })?;
        debug!(context = %inner.did(), %shard, total = manager.total(), "shard context created");
        Ok(Arc::new(Self {
            inner,
            strategy,
            manager: Arc::clone(manager),
        }))
    }

    /// The shard's inner context.
    pub fn inner(&self) -> &Arc<InnerContext> {
        &self.inner
    }

    /// This shard.
    pub fn shard(&self) -> ShardId {
        self.strategy.shard()
    }

    /// The launch.
    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    /// The shard's replication strategy.
    pub fn strategy(&self) -> &Arc<ShardedStrategy> {
        &self.strategy
    }

    fn runtime(&self) -> &Arc<Runtime> {
        self.manager.runtime()
    }

    /// Arrive on `barrier` and park until every shard has.
    fn sync(&self, barrier: PhaseBarrier, call: &'static str) -> Result<(), ContextError> {
        let substrate = self.runtime().substrate();
        let event = substrate.event(barrier)?;
        substrate.arrive(barrier, 1)?;
        trace!(shard = %self.shard(), %barrier, call, "shard arrived");
        event.wait().map_err(|_| ContextError::IllegalCall {
            call,
            reason: format!("barrier {barrier} was poisoned"),
        })
    }

    fn named(&self, tag: BarrierTag) -> Result<PhaseBarrier, ContextError> {
        self.strategy
            .barrier_for(tag)?
            .ok_or(ContextError::IllegalCall {
                call: tag.name(),
                reason: "no barrier for a replicated synchronization point".into(),
            })
    }

    // ── Barriers ───────────────────────────────────────────────────

    /// Next execution-fence barrier. Every shard sees the same sequence.
    pub fn get_next_execution_fence_barrier(&self) -> Result<PhaseBarrier, ContextError> {
        self.named(BarrierTag::ExecutionFence)
    }

    /// Next mapping-fence barrier.
    pub fn get_next_mapping_fence_barrier(&self) -> Result<PhaseBarrier, ContextError> {
        self.named(BarrierTag::MappingFence)
    }

    /// Next matched pair of collective-map barriers.
    pub fn next_collective_map_barriers(
        &self,
    ) -> Result<(PhaseBarrier, PhaseBarrier), ContextError> {
        self.strategy.next_pair(BarrierTag::CollectiveMap)
    }

    /// Next matched pair of indirection-copy barriers.
    pub fn next_indirection_barriers(&self) -> Result<(PhaseBarrier, PhaseBarrier), ContextError> {
        self.strategy.next_pair(BarrierTag::Indirection)
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Launch a child task once for the whole launch. The shard owning the
    /// launch runs it and broadcasts the result; the others receive it.
    pub fn execute_task(&self, launcher: TaskLauncher) -> Result<Future, ContextError> {
        self.strategy.record_call("execute_task");
        let launch = self.strategy.next_launch();
        let collective = self.strategy.next_collective_id();
        let owner = ShardId((launch % self.manager.total() as u64) as u32);
        let bc = ValueBroadcast::new(collective, owner);
        if owner == self.shard() {
            let handle = self.inner.issue_task(launcher)?;
            let manager = Arc::clone(&self.manager);
            handle.future.on_ready(move |result| {
                let payload = match result {
                    Ok(mut bytes) => {
                        bytes.insert(0, RESULT_READY);
                        bytes
                    }
                    Err(_) => vec![RESULT_POISONED],
                };
                if let Err(e) = bc.broadcast(&manager, payload) {
                    warn!(%collective, error = %e, "task result broadcast failed");
                }
            });
            return Ok(handle.future);
        }
        trace!(shard = %self.shard(), %owner, launch, "task runs on another shard");
        let received = bc.receive_async(&self.manager, self.shard())?;
        let result = Future::pending();
        let out = result.clone();
        received.on_ready(move |bytes| match bytes.as_deref() {
            Ok([RESULT_READY, rest @ ..]) => {
                out.set(rest.to_vec());
            }
            _ => {
                out.poison();
            }
        });
        let ready = result.ready_event();
        let mut spec = OpSpec::new(OpKind::Task)
            .with_label(format!("task {} (shard {})", launcher.task, owner))
            .with_behavior(Arc::new(FnBehavior(move |_: &Operation| Execution {
                effects: ready.clone(),
                value: None,
            })));
        for req in launcher.requirements {
            spec = spec.with_requirement(req);
        }
        self.inner.issue_operation(spec)?;
        Ok(result)
    }

    /// Stop recording `trace` and check that every shard captured the
    /// same template.
    pub fn end_trace(&self, trace: TraceId) -> Result<TraceOutcome, ContextError> {
        let outcome = self.inner.end_trace(trace)?;
        let fingerprint = self.inner.trace_fingerprint(outcome.template()).unwrap_or(0);
        let exchange = self.strategy.next_template_exchange();
        let all = exchange_template_updates(
            &self.manager,
            self.shard(),
            exchange,
            encode_u64s(&[fingerprint]),
        )?;
        let collective = CollectiveId(exchange);
        for (shard, bytes) in all {
            if decode_u64s(collective, &bytes)? != [fingerprint] {
                warn!(%trace, %shard, "trace templates differ between shards");
                return Err(ProtocolError::Divergence {
                    shard,
                    call: "end_trace",
                }
                .into());
            }
        }
        Ok(outcome)
    }

    /// Refine the shard's equivalence-set tree between the refinement
    /// ready and mapped barriers. Every shard refines the same way, and
    /// each new set takes the id its origin shard allocated.
    pub fn refine_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> Result<Vec<SetOverlap>, ContextError> {
        self.strategy.record_call("refine_equivalence_sets");
        let ready = self.named(BarrierTag::RefinementReady)?;
        let mapped = self.named(BarrierTag::RefinementMapped)?;
        self.sync(ready, "refine_equivalence_sets")?;
        let refined = self.inner.refine_equivalence_sets(requirement, bounds, mask);
        self.sync(mapped, "refine_equivalence_sets")?;
        refined
    }

    /// Copy whose source or destination is reached through an
    /// indirection. Every shard's copy arrives on the first barrier of a
    /// matched pair and completes once every shard's copy has arrived on
    /// the second.
    pub fn issue_indirect_copy(
        &self,
        src: RegionRequirement,
        dst: RegionRequirement,
    ) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("issue_indirect_copy");
        let (gathered, done) = self.next_indirection_barriers()?;
        let spec = OpSpec::new(OpKind::Copy)
            .with_label("indirect copy")
            .with_requirement(src)
            .with_requirement(dst)
            .with_behavior(Arc::new(IndirectionBehavior {
                runtime: Arc::clone(self.runtime()),
                gathered,
                done,
            }));
        self.inner.issue_operation(spec)
    }

    /// Create a collective view held by `holders`. The shards agree on
    /// its id and meet on a matched pair of barriers around the creation.
    pub fn map_collective_view(&self, holders: &[NodeId]) -> Result<DistributedId, ContextError> {
        let (arrived, mapped) = self.next_collective_map_barriers()?;
        self.sync(arrived, "map_collective_view")?;
        let view = self.inner.create_collective_view(holders)?;
        self.sync(mapped, "map_collective_view")?;
        Ok(view)
    }

    /// Values of `local` present on every shard.
    pub fn consensus_match(&self, local: &[u64]) -> Result<Vec<u64>, ContextError> {
        self.strategy.record_call("consensus_match");
        let collective = self.strategy.next_collective_id();
        consensus_match(&self.manager, self.shard(), collective, local)
    }

    /// Check that every shard has made the same calls so far.
    pub fn verify_replicable(&self) -> Result<(), ContextError> {
        let (hash, last_call) = self.strategy.call_hash();
        let collective = self.strategy.next_collective_id();
        verify_replicable(&self.manager, self.shard(), collective, hash, last_call)
    }

    /// End the shard's task. The shards meet on the resource-return
    /// barrier first so no shard tears down state another still reads.
    pub fn end_task(&self) -> Result<Event, ContextError> {
        if self.inner.is_ended() {
            return Err(ContextError::ContextEnded);
        }
        let returned = self.named(BarrierTag::ResourceReturn)?;
        self.sync(returned, "end_task")?;
        self.inner.end_task_returning(None)
    }
}

impl fmt::Debug for ReplicateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicateContext")
            .field("context", &self.inner.did())
            .field("shard", &self.shard())
            .field("total", &self.manager.total())
            .finish()
    }
}

struct IndirectionBehavior {
    runtime: Arc<Runtime>,
    gathered: PhaseBarrier,
    done: PhaseBarrier,
}

impl OpBehavior for IndirectionBehavior {
    fn execute(&self, op: &Operation) -> Execution {
        let substrate = self.runtime.substrate();
        let arrived = substrate
            .arrive(self.gathered, 1)
            .and_then(|()| substrate.event(self.done))
            .and_then(|done| substrate.arrive(self.done, 1).map(|()| done));
        match arrived {
            Ok(done) => Execution {
                effects: done,
                value: None,
            },
            Err(e) => {
                warn!(op = %op.index(), error = %e, "indirection barrier rejected");
                Execution {
                    effects: Event::poisoned(),
                    value: None,
                }
            }
        }
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ReplicateContext>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use weft_core::{FieldSpaceId, IndexSpaceId, LogicalRegion, RegionTreeId, TaskId};
    use weft_pipeline::WorkerPool;

    use crate::config::{ContextConfig, ReplicationConfig};
    use crate::context::Context;

    const REGION: LogicalRegion = LogicalRegion {
        tree: RegionTreeId(1),
        index_space: IndexSpaceId(1),
        field_space: FieldSpaceId(1),
    };

    fn launch(shards: usize) -> Vec<Arc<ReplicateContext>> {
        let rt = Runtime::new(
            NodeId(0),
            ContextConfig::default(),
            Arc::new(WorkerPool::new(2).unwrap()),
        )
        .unwrap();
        let mgr = ShardManager::new(rt, ReplicationConfig::shard(ShardId(0), shards)).unwrap();
        let reqs = vec![RegionRequirement::read_write(REGION, FieldMask::first_n(4))];
        mgr.shards()
            .map(|s| ReplicateContext::new(&mgr, s, reqs.clone(), Vec::new()).unwrap())
            .collect()
    }

    fn on_every_shard<T: Send>(
        shards: &[Arc<ReplicateContext>],
        f: impl Fn(&Arc<ReplicateContext>) -> T + Sync,
    ) -> Vec<T> {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = shards
                .iter()
                .map(|ctx| s.spawn(move || f(ctx)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn fence_barriers_match_across_shards() {
        let shards = launch(4);
        let seqs = on_every_shard(&shards, |c| {
            (0..5)
                .map(|_| c.get_next_execution_fence_barrier().unwrap())
                .collect::<Vec<_>>()
        });
        assert!(seqs.iter().all(|s| *s == seqs[0]));
    }

    #[test]
    fn task_result_reaches_every_shard() {
        let shards = launch(3);
        let values = on_every_shard(&shards, |c| {
            let launcher = TaskLauncher::new(TaskId(9), |_| Ok(vec![4, 2]));
            c.execute_task(launcher).unwrap().get().unwrap()
        });
        assert!(values.iter().all(|v| *v == vec![4, 2]));
    }

    #[test]
    fn poisoned_task_result_is_poisoned_everywhere() {
        let shards = launch(2);
        let results = on_every_shard(&shards, |c| {
            let launcher = TaskLauncher::new(TaskId(3), |_| {
                Err(ContextError::IllegalCall {
                    call: "body",
                    reason: "fails".into(),
                })
            });
            c.execute_task(launcher).unwrap().get().is_err()
        });
        assert!(results.iter().all(|poisoned| *poisoned));
    }

    #[test]
    fn replicated_field_spaces_agree() {
        let shards = launch(3);
        let ids = on_every_shard(&shards, |c| {
            let ctx = Context::Replicate(Arc::clone(c));
            ctx.resources("create_field_space")
                .unwrap()
                .create_field_space()
                .unwrap()
        });
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn consensus_keeps_common_values() {
        let shards = launch(3);
        let common = on_every_shard(&shards, |c| {
            let mine = [1, 2, 3, 10 + c.shard().0 as u64];
            c.consensus_match(&mine).unwrap()
        });
        assert!(common.iter().all(|v| *v == vec![1, 2, 3]));
    }

    #[test]
    fn matching_calls_verify() {
        let shards = launch(2);
        let results = on_every_shard(&shards, |c| {
            c.inner().issue_execution_fence().unwrap();
            c.verify_replicable()
        });
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn divergent_calls_are_reported() {
        let shards = launch(2);
        let results = on_every_shard(&shards, |c| {
            if c.shard() == ShardId(0) {
                c.strategy().record_call("issue_copy");
            }
            c.verify_replicable()
        });
        assert!(results.iter().all(|r| matches!(
            r,
            Err(ContextError::Protocol(ProtocolError::Divergence { .. }))
        )));
    }

    #[test]
    fn refinement_is_visible_to_every_shard() {
        let shards = launch(3);
        let found = on_every_shard(&shards, |c| {
            c.refine_equivalence_sets(0, &Rect::line(0, 15), &FieldMask::first_n(2))
                .unwrap()
                .len()
        });
        assert!(found.iter().all(|n| *n > 0));
    }

    #[test]
    fn shards_agree_on_refined_set_ids() {
        let shards = launch(4);
        let sets = on_every_shard(&shards, |c| {
            let mask = FieldMask::first_n(2);
            c.refine_equivalence_sets(0, &Rect::line(0, 31), &mask).unwrap();
            let mut found: Vec<_> = c
                .inner()
                .find_equivalence_sets(0, &Rect::line(0, 31), &mask)
                .unwrap()
                .wait()
                .unwrap()
                .into_iter()
                .map(|o| o.set.did)
                .collect();
            found.sort();
            found
        });
        assert!(!sets[0].is_empty());
        assert!(sets.iter().all(|s| *s == sets[0]));
        for c in &shards {
            // Only dependence analysis drew collective indices.
            assert_eq!(c.strategy().next_collective_id(), CollectiveId(0));
            assert!(c.strategy().next_logical_collective_id().0 > 1);
        }
    }

    #[test]
    fn task_launches_use_application_collectives() {
        let shards = launch(2);
        on_every_shard(&shards, |c| {
            let launcher = TaskLauncher::new(TaskId(1), |_| Ok(vec![9]));
            c.execute_task(launcher).unwrap().get().unwrap()
        });
        for c in &shards {
            assert_eq!(c.strategy().next_collective_id(), CollectiveId(2));
            assert_eq!(c.strategy().next_logical_collective_id(), CollectiveId(1));
        }
    }

    #[test]
    fn indirect_copies_complete_together() {
        let shards = launch(2);
        let done = on_every_shard(&shards, |c| {
            let h = c
                .issue_indirect_copy(
                    RegionRequirement::read_only(REGION, FieldMask::first_n(1)),
                    RegionRequirement::read_write(REGION, FieldMask::first_n(1)),
                )
                .unwrap();
            h.completed.wait().is_ok()
        });
        assert!(done.iter().all(|d| *d));
    }

    #[test]
    fn collective_views_share_an_id() {
        let shards = launch(2);
        let views = on_every_shard(&shards, |c| c.map_collective_view(&[]).unwrap());
        assert_eq!(views[0], views[1]);
        assert!(shards[0].inner().has_collective_view(views[0]));
        assert!(shards[1].inner().has_collective_view(views[0]));
    }

    #[test]
    fn shards_end_together() {
        let shards = launch(3);
        let ended = on_every_shard(&shards, |c| c.end_task().is_ok());
        assert!(ended.iter().all(|e| *e));
    }

    #[test]
    fn ending_consumes_one_resource_return_generation() {
        let shards = launch(2);
        on_every_shard(&shards, |c| c.end_task().unwrap());
        let fresh = ShardedStrategy::new(ShardId(0), Arc::clone(shards[0].manager()));
        fresh.barrier_for(BarrierTag::ResourceReturn).unwrap();
        let second = fresh.barrier_for(BarrierTag::ResourceReturn).unwrap();
        for c in &shards {
            assert_eq!(c.strategy().barrier_for(BarrierTag::ResourceReturn).unwrap(), second);
            assert!(matches!(c.end_task(), Err(ContextError::ContextEnded)));
        }
    }
}
