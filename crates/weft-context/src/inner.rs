//! The inner context: the context of a task that launches children.
//!
//! Every call that issues work allocates the next context index, records
//! the operation in the reorder buffer and hands it to the pipeline, all
//! under the child-operation lock so indices reach the pipeline in issue
//! order. The calling thread parks only in the window and frame throttles;
//! everything else is driven by pipeline meta-tasks through the
//! [`PipelineHost`] callbacks.
//!
//! Locks are taken in the order child operations, resources, equivalence
//! trees. No lock other than an equivalence tree's is held while a message
//! is sent; creating a set under it may broadcast the set's id to peer
//! shards.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};
use weft_core::{
    ContextError, ContextIndex, DistributedId, Event, FieldId, FieldMask, FieldSpaceId,
    NodeId, PhaseBarrier, Point, ReductionOpId, RegionTreeId, TraceId,
};
use weft_eqset::{
    EqKDRoot, EquivalenceSet, Rect, Release, SetFactory, SetOverlap,
};
use weft_pipeline::{
    ChildStage, Dependences, Execution, FenceKind, Future, OpBehavior, OpKind, OpRef, OpSpec,
    Operation, OperationPipeline, OperationPool, PipelineHost, Predicate, RegionRequirement,
    ReorderBuffer, StageCounts, TraceBoundary,
};

use crate::cache::FillViewCache;
use crate::config::ContextConfig;
use crate::context::{
    Context, NoReplication, OpHandle, PendingSets, ReplicationStrategy, TaskContext,
};
use crate::deps::DependenceTracker;
use crate::fence::{FenceRecord, FenceState};
use crate::fields::{LocalFieldInfo, LocalFields};
use crate::futures::{rect_points, FutureMap};
use crate::launcher::{IndexLauncher, TaskBody, TaskLauncher};
use crate::leaf::LeafContext;
use crate::message::{Message, SetReport, ViewAction};
use crate::metrics::{ContextMetrics, MetricsSnapshot};
use crate::regions::{primary_destroy, ResourceOwner};
use crate::remote::PackedContext;
use crate::replicate::barrier::BarrierTag;
use crate::resources::{DeletionOutcome, DestroyFn, Resource, ResourceTracker, ReturnedResources};
use crate::runtime::{ContextHandler, IdKind, Runtime};
use crate::throttle::Throttle;
use crate::trace::{TraceCache, TraceOutcome};

/// A dynamic collective: a phase barrier whose arrivals carry values folded
/// with a reduction operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicCollective {
    /// Barrier generation collecting the values.
    pub barrier: PhaseBarrier,
    /// Reduction folding them.
    pub redop: ReductionOpId,
}

/// Everything an inner context is built from.
pub struct InnerParams {
    /// Node runtime.
    pub runtime: Arc<Runtime>,
    /// Replication strategy.
    pub strategy: Arc<dyn ReplicationStrategy>,
    /// Parent context, absent at the root.
    pub parent: Option<Weak<InnerContext>>,
    /// Depth in the task tree; the root is zero.
    pub depth: u32,
    /// Privileges the task holds.
    pub requirements: Vec<RegionRequirement>,
    /// Task arguments.
    pub args: Vec<u8>,
    /// Launch point, for points of an index launch.
    pub point: Option<Point>,
    /// Counters, shared with the shard when replicated.
    pub metrics: Arc<ContextMetrics>,
}

#[derive(Debug, Default)]
struct Children {
    next_index: u64,
    total: u64,
    rob: ReorderBuffer,
}

#[derive(Debug, Default)]
struct Analysis {
    fences: FenceState,
    deps: DependenceTracker,
}

/// Context of a task that launches children.
pub struct InnerContext {
    this: Weak<InnerContext>,
    did: DistributedId,
    runtime: Arc<Runtime>,
    config: ContextConfig,
    strategy: Arc<dyn ReplicationStrategy>,
    parent: Option<Weak<InnerContext>>,
    depth: u32,
    args: Vec<u8>,
    point: Option<Point>,
    requirements: Vec<RegionRequirement>,
    created_trees: RwLock<HashSet<RegionTreeId>>,
    pipeline: OperationPipeline,
    pool: OperationPool,
    retired: Mutex<Vec<Arc<Operation>>>,
    window: Throttle,
    frames: Throttle,
    children: Mutex<Children>,
    unordered: Mutex<Vec<OpSpec>>,
    analysis: Mutex<Analysis>,
    resources: Mutex<ResourceTracker>,
    deletions: Mutex<HashMap<ContextIndex, Resource>>,
    trees: Mutex<HashMap<u32, Arc<EqKDRoot>>>,
    fill_views: Mutex<FillViewCache>,
    local_fields: Mutex<LocalFields>,
    traces: Mutex<TraceCache>,
    remote_holders: Mutex<BTreeSet<NodeId>>,
    views: Mutex<HashSet<DistributedId>>,
    metrics: Arc<ContextMetrics>,
    ended: AtomicBool,
    destroy: DestroyFn,
}

impl InnerContext {
    /// Build a context and register it with the runtime.
    pub fn new(params: InnerParams) -> Result<Arc<Self>, ContextError> {
        let config = params.runtime.config().clone();
        let did = DistributedId(params.runtime.allocate(IdKind::Distributed));
        let scheduler = Arc::clone(params.runtime.scheduler());
        let destroy = primary_destroy(&params.runtime, &params.strategy);
        let ctx = Arc::new_cyclic(|this: &Weak<InnerContext>| {
            let host: Weak<dyn PipelineHost> = this.clone();
            InnerContext {
                this: this.clone(),
                did,
                pipeline: OperationPipeline::new(host, scheduler),
                pool: OperationPool::new(config.op_pool_size),
                retired: Mutex::new(Vec::new()),
                window: Throttle::new(
                    "window",
                    config.max_window_size,
                    config.hysteresis_percentage,
                ),
                frames: Throttle::new(
                    "frames",
                    config.max_outstanding_frames,
                    config.hysteresis_percentage,
                ),
                children: Mutex::new(Children::default()),
                unordered: Mutex::new(Vec::new()),
                analysis: Mutex::new(Analysis::default()),
                resources: Mutex::new(ResourceTracker::new()),
                deletions: Mutex::new(HashMap::new()),
                trees: Mutex::new(HashMap::new()),
                fill_views: Mutex::new(FillViewCache::new(config.fill_view_cache_size)),
                local_fields: Mutex::new(LocalFields::new()),
                traces: Mutex::new(TraceCache::new(config.max_templates_per_trace)),
                remote_holders: Mutex::new(BTreeSet::new()),
                views: Mutex::new(HashSet::new()),
                created_trees: RwLock::new(HashSet::new()),
                ended: AtomicBool::new(false),
                runtime: params.runtime,
                config,
                strategy: params.strategy,
                parent: params.parent,
                depth: params.depth,
                args: params.args,
                point: params.point,
                requirements: params.requirements,
                metrics: params.metrics,
                destroy,
            }
        });
        ctx.runtime.ledger().register(did);
        let handler: Arc<dyn ContextHandler> = ctx.clone();
        ctx.runtime
            .register_context(did, Arc::downgrade(&handler))?;
        debug!(context = %did, depth = ctx.depth, shard = %ctx.strategy.shard(), "context created");
        Ok(ctx)
    }

    /// Root context of a task tree running alone.
    pub fn root(runtime: Arc<Runtime>) -> Result<Arc<Self>, ContextError> {
        Self::new(InnerParams {
            runtime,
            strategy: Arc::new(NoReplication),
            parent: None,
            depth: 0,
            requirements: Vec::new(),
            args: Vec::new(),
            point: None,
            metrics: Arc::new(ContextMetrics::new()),
        })
    }

    /// Context of a child task launched by `parent`.
    pub fn child(
        parent: &Arc<InnerContext>,
        requirements: Vec<RegionRequirement>,
        args: Vec<u8>,
        point: Option<Point>,
    ) -> Result<Arc<Self>, ContextError> {
        Self::new(InnerParams {
            runtime: Arc::clone(&parent.runtime),
            strategy: Arc::new(NoReplication),
            parent: Some(Arc::downgrade(parent)),
            depth: parent.depth + 1,
            requirements,
            args,
            point,
            metrics: Arc::new(ContextMetrics::new()),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Distributed id of the context.
    pub fn did(&self) -> DistributedId {
        self.did
    }

    /// Node runtime.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Configuration fixed at construction.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Replication strategy.
    pub fn strategy(&self) -> &Arc<dyn ReplicationStrategy> {
        &self.strategy
    }

    /// Task arguments.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Launch point.
    pub fn point(&self) -> Option<&Point> {
        self.point.as_ref()
    }

    /// Depth in the task tree.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Privileges the task holds.
    pub fn requirements(&self) -> &[RegionRequirement] {
        &self.requirements
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The counters.
    pub fn metrics_handle(&self) -> &Arc<ContextMetrics> {
        &self.metrics
    }

    /// Children issued but not yet completed.
    pub fn outstanding_children_count(&self) -> usize {
        self.window.outstanding()
    }

    /// Children ever issued.
    pub fn total_children(&self) -> u64 {
        self.children.lock().total
    }

    /// Per-stage counts of children still in the reorder buffer.
    pub fn child_stage_counts(&self) -> StageCounts {
        self.children.lock().rob.counts()
    }

    /// Children still in the reorder buffer.
    pub fn reorder_buffer_len(&self) -> usize {
        self.children.lock().rob.len()
    }

    /// Whether an issuer is parked in the window throttle.
    pub fn is_window_blocked(&self) -> bool {
        self.window.is_blocked()
    }

    /// Frames issued but not yet completed.
    pub fn outstanding_frames(&self) -> usize {
        self.frames.outstanding()
    }

    /// Operations queued in any pipeline stage.
    pub fn in_flight(&self) -> usize {
        self.pipeline.in_flight()
    }

    /// Whether the context tracks `resource` as live.
    pub fn owns(&self, resource: &Resource) -> bool {
        self.resources.lock().owns(resource)
    }

    /// Use count of a live resource.
    pub fn resource_uses(&self, resource: &Resource) -> Option<u32> {
        self.resources.lock().uses(resource)
    }

    /// Whether the context has privileges on every region of `tree`.
    pub fn has_created_tree(&self, tree: RegionTreeId) -> bool {
        self.created_trees.read().contains(&tree)
    }

    /// Local fields allocated in `fs`, including those of remote copies.
    pub fn local_fields(&self, fs: FieldSpaceId) -> Vec<LocalFieldInfo> {
        self.local_fields.lock().fields(fs)
    }

    /// Number of templates kept for `trace`.
    pub fn trace_template_count(&self, trace: TraceId) -> usize {
        self.traces.lock().template_count(trace)
    }

    /// Fingerprint of a kept template.
    pub fn trace_fingerprint(&self, template: u64) -> Option<u64> {
        self.traces.lock().fingerprint(template)
    }

    /// Nodes holding a remote copy of the context.
    pub fn remote_holders(&self) -> Vec<NodeId> {
        self.remote_holders.lock().iter().copied().collect()
    }

    /// Whether [`end_task`](Self::end_task) has run.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    // ── Issue path ─────────────────────────────────────────────────

    fn check_privileges(
        &self,
        call: &'static str,
        requirements: &[RegionRequirement],
    ) -> Result<(), ContextError> {
        let created = self.created_trees.read();
        for req in requirements {
            if created.contains(&req.region.tree) {
                continue;
            }
            let mut same_tree = self
                .requirements
                .iter()
                .filter(|p| p.region.tree == req.region.tree)
                .peekable();
            if same_tree.peek().is_none() {
                return Err(ContextError::PrivilegeViolation {
                    call,
                    region: req.region,
                    reason: format!("no privilege on region tree {}", req.region.tree),
                });
            }
            let covered = same_tree
                .any(|p| req.fields.is_subset(&p.fields) && p.privilege.covers(req.privilege));
            if !covered {
                return Err(ContextError::PrivilegeViolation {
                    call,
                    region: req.region,
                    reason: format!(
                        "{:?} on the requested fields is not covered by the task's privileges",
                        req.privilege
                    ),
                });
            }
        }
        Ok(())
    }

    fn release_retired(&self) {
        let retired = std::mem::take(&mut *self.retired.lock());
        for op in retired {
            self.pool.release(op);
        }
    }

    fn drain_unordered(&self) -> Result<(), ContextError> {
        let pending = std::mem::take(&mut *self.unordered.lock());
        for spec in pending {
            trace!(context = %self.did, kind = %spec.kind, "unordered operation inserted");
            self.issue_spec(spec, |_| {})?;
        }
        Ok(())
    }

    fn issue_with<F>(&self, spec: OpSpec, before: F) -> Result<OpHandle, ContextError>
    where
        F: FnOnce(ContextIndex),
    {
        if self.is_ended() {
            return Err(ContextError::ContextEnded);
        }
        self.drain_unordered()?;
        self.issue_spec(spec, before)
    }

    fn issue_spec<F>(&self, spec: OpSpec, before: F) -> Result<OpHandle, ContextError>
    where
        F: FnOnce(ContextIndex),
    {
        self.check_privileges(spec.kind.name(), &spec.requirements)?;
        self.release_retired();
        if self.window.acquire() {
            self.metrics.record_window_wait();
        }
        if spec.kind == OpKind::Frame && self.frames.acquire() {
            self.metrics.record_frame_wait();
        }
        self.traces.lock().record(spec.kind, &spec.requirements);
        let op = {
            let mut children = self.children.lock();
            let index = ContextIndex(children.next_index);
            children.next_index += 1;
            children.total += 1;
            let op = self.pool.acquire(index, spec);
            children.rob.insert(OpRef::new(&op), index);
            before(index);
            self.pipeline.issue(Arc::clone(&op));
            op
        };
        self.metrics.record_issued();
        Ok(OpHandle {
            index: op.index(),
            mapped: op.mapped_event(),
            completed: op.completion_event(),
            future: op.result(),
        })
    }

    /// Queue an operation injected from outside the task body. It enters
    /// the stream at the next issue call.
    pub fn add_to_unordered_ops(&self, spec: OpSpec) {
        trace!(context = %self.did, kind = %spec.kind, "unordered operation queued");
        self.unordered.lock().push(spec);
    }

    /// Completion events of children issued before `index` that have not
    /// reached `stage`-equivalent progress.
    fn prior_incomplete(&self, index: ContextIndex, kind: FenceKind) -> Vec<Event> {
        let children = self.children.lock();
        children
            .rob
            .incomplete()
            .filter(|e| e.operation_index < index)
            .filter_map(|e| e.operation.get())
            .map(|op| match kind {
                FenceKind::Mapping => op.mapped_event(),
                FenceKind::Execution => op.completion_event(),
            })
            .collect()
    }

    fn notify_holders(&self, msg: Message) {
        let holders: Vec<NodeId> = self.remote_holders.lock().iter().copied().collect();
        for node in holders {
            if let Err(e) = self.runtime.send(node, msg.clone()) {
                warn!(context = %self.did, %node, error = %e, "remote copy not updated");
            }
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Launch a child task. The future resolves to the body's return value.
    pub fn execute_task(&self, launcher: TaskLauncher) -> Result<Future, ContextError> {
        self.strategy.record_call("execute_task");
        Ok(self.issue_task(launcher)?.future)
    }

    pub(crate) fn issue_task(&self, launcher: TaskLauncher) -> Result<OpHandle, ContextError> {
        let mut spec = OpSpec::new(OpKind::Task).with_label(format!("task {}", launcher.task));
        for req in &launcher.requirements {
            spec = spec.with_requirement(req.clone());
        }
        if let Some((predicate, false_value)) = launcher.predicate.clone() {
            spec = spec.with_predicate(predicate, false_value);
        }
        spec = spec.with_behavior(Arc::new(TaskBehavior {
            parent: self.this.clone(),
            launcher,
        }));
        self.issue_operation(spec)
    }

    /// Launch one leaf task per point of the launcher's domain.
    ///
    /// In a replicated context each shard runs the points it owns; the
    /// futures of points run elsewhere resolve empty on this shard.
    pub fn execute_index_space(&self, launcher: IndexLauncher) -> Result<FutureMap, ContextError> {
        self.strategy.record_call("execute_index_space");
        let points = rect_points(&launcher.domain);
        let map = FutureMap::pending(points.iter().cloned());
        let mut spec = OpSpec::new(OpKind::IndexTask)
            .with_label(format!("index task {} over {} points", launcher.task, points.len()));
        for req in &launcher.requirements {
            spec = spec.with_requirement(req.clone());
        }
        spec = spec.with_behavior(Arc::new(IndexBehavior {
            parent: self.this.clone(),
            requirements: launcher.requirements,
            body: launcher.body,
            args: launcher.args,
            points,
            map: map.clone(),
        }));
        let handle = self.issue_operation(spec)?;
        let leftovers = map.clone();
        handle.completed.subscribe(move |poisoned| {
            for (_, future) in leftovers.iter() {
                if poisoned {
                    future.poison();
                } else {
                    future.set(Vec::new());
                }
            }
        });
        Ok(map)
    }

    // ── Data movement ──────────────────────────────────────────────

    /// Fill `requirement`'s fields with `value`.
    pub fn fill_fields(
        &self,
        requirement: RegionRequirement,
        value: &[u8],
    ) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("fill_fields");
        if !requirement.privilege.is_write() {
            return Err(ContextError::PrivilegeViolation {
                call: "fill_fields",
                region: requirement.region,
                reason: "fills need a write privilege".into(),
            });
        }
        let runtime = Arc::clone(&self.runtime);
        let view = self
            .fill_views
            .lock()
            .find_or_create(value, || DistributedId(runtime.allocate(IdKind::Distributed)));
        if view.hit {
            self.metrics.record_fill_hit();
        } else {
            self.metrics.record_fill_miss();
        }
        let spec = OpSpec::new(OpKind::Fill)
            .with_requirement(requirement)
            .with_label(format!("fill view {}", view.view));
        self.issue_operation(spec)
    }

    /// Copy `src` into `dst`.
    pub fn issue_copy(
        &self,
        src: RegionRequirement,
        dst: RegionRequirement,
    ) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("issue_copy");
        let spec = OpSpec::new(OpKind::Copy)
            .with_requirement(src)
            .with_requirement(dst);
        self.issue_operation(spec)
    }

    fn barrier_spec(&self, kind: OpKind, tag: BarrierTag) -> Result<OpSpec, ContextError> {
        let mut spec = OpSpec::new(kind);
        if let Some(barrier) = self.strategy.barrier_for(tag)? {
            trace!(context = %self.did, %tag, %barrier, "barrier drawn");
            spec = spec.with_behavior(Arc::new(ArriveBehavior {
                runtime: Arc::clone(&self.runtime),
                barrier,
                count: 1,
                value: None,
                arrive: true,
                wait: true,
            }));
        }
        Ok(spec)
    }

    /// Order mapping of later operations after every earlier one.
    pub fn issue_mapping_fence(&self) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("issue_mapping_fence");
        let spec = self.barrier_spec(OpKind::Fence(FenceKind::Mapping), BarrierTag::MappingFence)?;
        self.issue_operation(spec)
    }

    /// Order later operations after every earlier one completes.
    pub fn issue_execution_fence(&self) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("issue_execution_fence");
        let spec = self.barrier_spec(
            OpKind::Fence(FenceKind::Execution),
            BarrierTag::ExecutionFence,
        )?;
        self.issue_operation(spec)
    }

    /// Mark a frame boundary. Parks while the maximum number of frames is
    /// outstanding; a frame completes once everything before it has.
    pub fn issue_frame(&self) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("issue_frame");
        self.issue_operation(OpSpec::new(OpKind::Frame))
    }

    /// Attach external data to `requirement`.
    pub fn attach_external(
        &self,
        requirement: RegionRequirement,
    ) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("attach_external");
        let spec = self
            .barrier_spec(OpKind::Attach, BarrierTag::AttachDetach)?
            .with_requirement(requirement);
        self.issue_operation(spec)
    }

    /// Detach external data from `requirement`.
    pub fn detach_external(
        &self,
        requirement: RegionRequirement,
    ) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("detach_external");
        let spec = self
            .barrier_spec(OpKind::Detach, BarrierTag::AttachDetach)?
            .with_requirement(requirement);
        self.issue_operation(spec)
    }

    /// Detach `requirement` at the next issue call rather than now.
    pub fn detach_deferred(&self, requirement: RegionRequirement) {
        self.add_to_unordered_ops(
            OpSpec::new(OpKind::Detach)
                .with_requirement(requirement)
                .with_label("deferred detach"),
        );
    }

    // ── Traces ─────────────────────────────────────────────────────

    /// Start recording `trace`. The boundary operation itself is not part
    /// of the recording.
    pub fn begin_trace(&self, trace: TraceId) -> Result<(), ContextError> {
        self.strategy.record_call("begin_trace");
        if let Some(active) = self.traces.lock().active() {
            return Err(ContextError::IllegalCall {
                call: "begin_trace",
                reason: format!("trace {active} is still being recorded"),
            });
        }
        let spec = OpSpec::new(OpKind::Trace(TraceBoundary::Begin))
            .with_label(format!("trace {trace}"));
        self.issue_operation(spec)?;
        self.traces.lock().begin(trace)
    }

    /// Stop recording `trace` and capture or replay its template.
    pub fn end_trace(&self, trace: TraceId) -> Result<TraceOutcome, ContextError> {
        self.strategy.record_call("end_trace");
        let outcome = self.traces.lock().end(trace)?;
        let spec = OpSpec::new(OpKind::Trace(TraceBoundary::End))
            .with_label(format!("trace {trace}"));
        self.issue_operation(spec)?;
        Ok(outcome)
    }

    // ── Predicates ─────────────────────────────────────────────────

    /// Predicate backed by `future`; any non-zero byte reads as true.
    pub fn create_predicate(&self, future: &Future) -> Result<Predicate, ContextError> {
        self.strategy.record_call("create_predicate");
        let ready = future.ready_event();
        let spec = OpSpec::new(OpKind::Predicate).with_behavior(Arc::new(
            weft_pipeline::FnBehavior(move |_: &Operation| Execution {
                effects: Event::all_settled([ready.clone()]),
                value: None,
            }),
        ));
        self.issue_operation(spec)?;
        Ok(Predicate::from_future(future.clone()))
    }

    /// Negation of `p`.
    pub fn predicate_not(&self, p: &Predicate) -> Predicate {
        self.strategy.record_call("predicate_not");
        p.not()
    }

    /// Conjunction of `preds`.
    pub fn predicate_and(&self, preds: &[Predicate]) -> Predicate {
        self.strategy.record_call("predicate_and");
        Predicate::and(preds)
    }

    /// Disjunction of `preds`.
    pub fn predicate_or(&self, preds: &[Predicate]) -> Predicate {
        self.strategy.record_call("predicate_or");
        Predicate::or(preds)
    }

    // ── Phase barriers and dynamic collectives ─────────────────────

    /// Barrier expecting `arrivals` per generation.
    pub fn create_phase_barrier(&self, arrivals: usize) -> Result<PhaseBarrier, ContextError> {
        self.strategy.record_call("create_phase_barrier");
        self.strategy.create_barrier(&self.runtime, arrivals)
    }

    /// Arrive `count` times on `barrier` once earlier work allows.
    pub fn arrive_phase_barrier(
        &self,
        barrier: PhaseBarrier,
        count: usize,
    ) -> Result<OpHandle, ContextError> {
        self.strategy.record_call("arrive_phase_barrier");
        let spec = OpSpec::new(OpKind::PhaseBarrier).with_behavior(Arc::new(ArriveBehavior {
            runtime: Arc::clone(&self.runtime),
            barrier,
            count,
            value: None,
            arrive: self.strategy.is_primary(),
            wait: false,
        }));
        self.issue_operation(spec)
    }

    /// The generation after `barrier`.
    pub fn advance_phase_barrier(
        &self,
        barrier: PhaseBarrier,
    ) -> Result<PhaseBarrier, ContextError> {
        self.strategy.record_call("advance_phase_barrier");
        Ok(self.runtime.substrate().advance(barrier)?)
    }

    /// Event of a barrier generation.
    pub fn phase_barrier_event(&self, barrier: PhaseBarrier) -> Result<Event, ContextError> {
        Ok(self.runtime.substrate().event(barrier)?)
    }

    /// Destroy `barrier`.
    pub fn destroy_phase_barrier(&self, barrier: PhaseBarrier) -> Result<(), ContextError> {
        self.strategy.record_call("destroy_phase_barrier");
        if self.strategy.is_primary() {
            self.runtime.substrate().destroy(barrier)?;
        }
        Ok(())
    }

    /// Dynamic collective expecting `arrivals` contributions folded by
    /// `redop`.
    pub fn create_dynamic_collective(
        &self,
        arrivals: usize,
        redop: ReductionOpId,
    ) -> Result<DynamicCollective, ContextError> {
        self.strategy.record_call("create_dynamic_collective");
        if self.runtime.reduction(redop).is_none() {
            return Err(ContextError::IllegalCall {
                call: "create_dynamic_collective",
                reason: format!("reduction {redop} is not registered"),
            });
        }
        let barrier = self.strategy.create_barrier(&self.runtime, arrivals)?;
        Ok(DynamicCollective { barrier, redop })
    }

    /// Contribute `value` with `count` arrivals.
    pub fn arrive_dynamic_collective(
        &self,
        dc: DynamicCollective,
        value: Vec<u8>,
        count: usize,
    ) -> Result<(), ContextError> {
        self.strategy.record_call("arrive_dynamic_collective");
        if self.strategy.is_primary() {
            self.runtime
                .substrate()
                .arrive_with(dc.barrier, count, Some(value))?;
        }
        Ok(())
    }

    /// Contribute the value of `future` once it resolves. A poisoned future
    /// arrives without a value.
    pub fn defer_dynamic_collective_arrival(
        &self,
        dc: DynamicCollective,
        future: &Future,
        count: usize,
    ) {
        self.strategy.record_call("defer_dynamic_collective_arrival");
        if !self.strategy.is_primary() {
            return;
        }
        let substrate = Arc::clone(self.runtime.substrate());
        future.on_ready(move |value| {
            let outcome = substrate.arrive_with(dc.barrier, count, value.ok());
            if let Err(e) = outcome {
                error!(barrier = %dc.barrier, error = %e, "deferred collective arrival failed");
            }
        });
    }

    /// Future of the folded contributions of `dc`'s generation.
    pub fn get_dynamic_collective_result(
        &self,
        dc: DynamicCollective,
    ) -> Result<Future, ContextError> {
        self.strategy.record_call("get_dynamic_collective_result");
        let event = self.runtime.substrate().event(dc.barrier)?;
        let out = Future::pending();
        let result = out.clone();
        let runtime = Arc::clone(&self.runtime);
        event.subscribe(move |poisoned| {
            if poisoned {
                result.poison();
                return;
            }
            match runtime.substrate().contributions(dc.barrier) {
                Ok(values) => {
                    result.set(runtime.fold(dc.redop, &values).unwrap_or_default());
                }
                Err(e) => {
                    error!(barrier = %dc.barrier, error = %e, "collective result lost");
                    result.poison();
                }
            }
        });
        Ok(out)
    }

    /// The next generation of `dc`.
    pub fn advance_dynamic_collective(
        &self,
        dc: DynamicCollective,
    ) -> Result<DynamicCollective, ContextError> {
        self.strategy.record_call("advance_dynamic_collective");
        Ok(DynamicCollective {
            barrier: self.runtime.substrate().advance(dc.barrier)?,
            redop: dc.redop,
        })
    }

    // ── Equivalence sets ───────────────────────────────────────────

    fn equivalence_tree(&self, requirement: u32, bounds: &Rect) -> Arc<EqKDRoot> {
        let root_bounds = self
            .requirements
            .get(requirement as usize)
            .and_then(|r| self.runtime.forest().index_space_bounds(r.region.index_space))
            .unwrap_or_else(|| bounds.clone());
        let mut trees = self.trees.lock();
        Arc::clone(
            trees
                .entry(requirement)
                .or_insert_with(|| Arc::new(EqKDRoot::new(root_bounds))),
        )
    }

    /// Factory for sets created by the task's own analysis. Peer shards
    /// make the same calls, so they agree on each new set's id.
    fn set_factory(&self) -> SetMaker<'_> {
        SetMaker {
            ctx: self,
            shared: true,
            failed: None,
        }
    }

    /// Subdivide the sets covering `bounds`, moving `mask` to finer sets.
    pub fn refine_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> Result<Vec<SetOverlap>, ContextError> {
        let tree = self.equivalence_tree(requirement, bounds);
        let mut factory = self.set_factory();
        let refined = tree.refine(bounds, mask, &mut factory).local;
        factory.finish()?;
        Ok(refined)
    }

    /// Drop the sets covering `bounds` for `mask`. Returns how many tree
    /// nodes were invalidated.
    pub fn invalidate_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> usize {
        self.equivalence_tree(requirement, bounds)
            .invalidate(bounds, mask)
    }

    /// Mark `bounds` of a requirement's tree as owned by `owner`.
    pub fn set_remote_owner(&self, requirement: u32, bounds: &Rect, owner: NodeId) {
        self.equivalence_tree(requirement, bounds)
            .set_remote(bounds, owner);
    }

    fn answer_eq_request(
        &self,
        request: u64,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
        reply_to: NodeId,
    ) {
        let tree = self.equivalence_tree(requirement, bounds);
        // Only this shard answers, so its peers cannot join an agreement.
        let mut factory = SetMaker {
            ctx: self,
            shared: false,
            failed: None,
        };
        let lookup = tree.compute(bounds, mask, &mut factory);
        if !lookup.remote.is_empty() {
            warn!(context = %self.did, request, "nested remote subtrees are not forwarded");
        }
        let sets = lookup.local.into_iter().map(set_report).collect();
        if let Err(e) = self
            .runtime
            .send(reply_to, Message::EqSetResponse { request, sets })
        {
            error!(context = %self.did, request, error = %e, "equivalence-set reply lost");
        }
    }

    // ── Remote copies and collective views ─────────────────────────

    /// Pack a copy of the context for `target` and count it as a holder.
    pub fn pack_remote_context(&self, target: NodeId) -> Result<PackedContext, ContextError> {
        self.runtime
            .ledger()
            .add_remote(self.did, target)
            .map_err(|e| ContextError::IllegalCall {
                call: "pack_remote_context",
                reason: e.to_string(),
            })?;
        self.remote_holders.lock().insert(target);
        let created_regions = self.resources.lock().regions();
        debug!(context = %self.did, %target, "context packed");
        Ok(PackedContext {
            did: self.did,
            owner: self.runtime.node(),
            depth: self.depth,
            requirements: self.requirements.clone(),
            local_fields: self.local_fields.lock().all(),
            created_regions,
        })
    }

    /// Create a collective view held by `holders`.
    pub fn create_collective_view(
        &self,
        holders: &[NodeId],
    ) -> Result<DistributedId, ContextError> {
        self.strategy.record_call("create_collective_view");
        let view = DistributedId(self.strategy.allocate(&self.runtime, IdKind::Distributed)?);
        let ledger = self.runtime.ledger();
        ledger.register(view);
        for &node in holders {
            ledger
                .add_remote(view, node)
                .map_err(|e| ContextError::IllegalCall {
                    call: "create_collective_view",
                    reason: e.to_string(),
                })?;
        }
        self.views.lock().insert(view);
        let msg = Message::CollectiveView {
            context: self.did,
            action: ViewAction::Create,
            view,
        };
        for &node in holders {
            self.runtime.send(node, msg.clone())?;
        }
        debug!(context = %self.did, %view, holders = holders.len(), "collective view created");
        Ok(view)
    }

    /// Drop the local reference to `view` and ask its holders to release
    /// theirs. Returns whether the view was reclaimed immediately.
    pub fn delete_collective_view(&self, view: DistributedId) -> Result<bool, ContextError> {
        self.strategy.record_call("delete_collective_view");
        if !self.views.lock().contains(&view) {
            return Err(ContextError::IllegalCall {
                call: "delete_collective_view",
                reason: format!("view {view} is not live in context {}", self.did),
            });
        }
        let ledger = self.runtime.ledger();
        let holders = ledger.holders(view).map(|(_, h)| h).unwrap_or_default();
        let release = ledger
            .remove_local(view)
            .map_err(|e| ContextError::IllegalCall {
                call: "delete_collective_view",
                reason: e.to_string(),
            })?;
        if release == Release::Reclaimed {
            self.views.lock().remove(&view);
            return Ok(true);
        }
        let msg = Message::CollectiveView {
            context: self.did,
            action: ViewAction::Delete,
            view,
        };
        for node in holders {
            self.runtime.send(node, msg.clone())?;
        }
        Ok(false)
    }

    /// Whether `view` is still live here.
    pub fn has_collective_view(&self, view: DistributedId) -> bool {
        self.views.lock().contains(&view)
    }

    // ── Task end ───────────────────────────────────────────────────

    /// Take ownership of resources returned by a child.
    pub fn receive_returned(&self, returned: ReturnedResources) -> Result<(), ContextError> {
        let trees: Vec<RegionTreeId> = returned
            .created
            .iter()
            .filter_map(|r| match r.resource {
                Resource::Region(region) => Some(region.tree),
                _ => None,
            })
            .collect();
        let outcomes = self
            .resources
            .lock()
            .receive_returned(returned, &self.destroy);
        self.created_trees.write().extend(trees);
        trace!(context = %self.did, deletions = outcomes.len(), "child resources received");
        Ok(())
    }

    /// End the task: return resources to the parent, or destroy them at
    /// the root, and report accounting problems.
    ///
    /// Returns the event triggered once every child has completed. Nothing
    /// waits on it here.
    pub fn end_task(&self) -> Result<Event, ContextError> {
        if self.is_ended() {
            return Err(ContextError::ContextEnded);
        }
        let returned = self.strategy.barrier_for(BarrierTag::ResourceReturn)?;
        self.end_task_returning(returned)
    }

    /// [`end_task`](Self::end_task) arriving on `returned`, when given,
    /// once every child has completed. A caller that already met its peers
    /// on the resource-return barrier passes `None`.
    pub(crate) fn end_task_returning(
        &self,
        returned: Option<PhaseBarrier>,
    ) -> Result<Event, ContextError> {
        if self.is_ended() {
            return Err(ContextError::ContextEnded);
        }
        self.drain_unordered()?;
        if self.ended.swap(true, Ordering::AcqRel) {
            return Err(ContextError::ContextEnded);
        }
        let pending: Vec<Event> = {
            let children = self.children.lock();
            children
                .rob
                .incomplete()
                .filter_map(|e| e.operation.get().map(|op| op.completion_event()))
                .collect()
        };
        let mut done = Event::all_settled(pending);
        if let Some(barrier) = returned {
            let substrate = Arc::clone(self.runtime.substrate());
            let returned = substrate.event(barrier)?;
            done.subscribe(move |_| {
                if let Err(e) = substrate.arrive(barrier, 1) {
                    error!(%barrier, error = %e, "resource-return arrival failed");
                }
            });
            done = Event::all_settled([done, returned]);
        }
        let policy = self.config.leak_policy;
        let report = match self.parent.as_ref().and_then(Weak::upgrade) {
            Some(parent) => {
                let returned = self.resources.lock().return_resources();
                parent.receive_returned(returned)?;
                self.resources.lock().report_leaks_and_duplicates(policy)
            }
            None => {
                let mut resources = self.resources.lock();
                let report = resources.report_leaks_and_duplicates(policy);
                let destroyed = resources.destroy_all(done.clone(), &self.destroy);
                debug!(context = %self.did, destroyed, "root resources scheduled for destruction");
                report
            }
        };
        match self.runtime.ledger().remove_local(self.did) {
            Ok(Release::Reclaimed) => self.runtime.unregister_context(self.did),
            Ok(Release::Retained) => {
                debug!(context = %self.did, "context retained by remote holders");
            }
            Err(e) => warn!(context = %self.did, error = %e, "context ledger entry missing"),
        }
        debug!(context = %self.did, "task ended");
        report?;
        Ok(done)
    }
}

/// Creates equivalence sets for one tree operation.
///
/// A failure to agree on an id cannot stop the tree mid-update; the set
/// falls back to a node-local id and the failure is reported by
/// [`SetMaker::finish`].
struct SetMaker<'a> {
    ctx: &'a InnerContext,
    shared: bool,
    failed: Option<ContextError>,
}

impl SetMaker<'_> {
    fn finish(self) -> Result<(), ContextError> {
        self.failed.map_or(Ok(()), Err)
    }
}

impl SetFactory for SetMaker<'_> {
    fn create(&mut self, bounds: &Rect) -> Arc<EquivalenceSet> {
        let runtime = &self.ctx.runtime;
        let agreed = if self.shared && self.failed.is_none() {
            self.ctx.strategy.equivalence_set_id(runtime)
        } else {
            Ok(DistributedId(runtime.allocate(IdKind::EquivalenceSet)))
        };
        let did = agreed.unwrap_or_else(|e| {
            error!(context = %self.ctx.did, error = %e, "equivalence-set id not agreed");
            self.failed = Some(e);
            DistributedId(runtime.allocate(IdKind::EquivalenceSet))
        });
        trace!(context = %self.ctx.did, set = %did, "equivalence set created");
        Arc::new(EquivalenceSet::new(did, runtime.node(), bounds.clone()))
    }
}

fn set_report(o: SetOverlap) -> SetReport {
    SetReport {
        did: o.set.did,
        owner: o.set.owner,
        bounds: o.set.bounds.clone(),
        mask: o.mask,
    }
}

/// Smallest rectangle containing both `a` and `b`.
fn bounding(a: &Rect, b: &Rect) -> Rect {
    let lo: Point = a.lo.iter().zip(b.lo.iter()).map(|(x, y)| *x.min(y)).collect();
    let hi: Point = a.hi.iter().zip(b.hi.iter()).map(|(x, y)| *x.max(y)).collect();
    Rect::new(lo, hi)
}

// ── Capabilities ───────────────────────────────────────────────────

impl TaskContext for InnerContext {
    fn issue_operation(&self, spec: OpSpec) -> Result<OpHandle, ContextError> {
        self.issue_with(spec, |_| {})
    }

    fn track_resource(&self, resource: Resource) -> Result<(), ContextError> {
        if self.is_ended() {
            return Err(ContextError::ContextEnded);
        }
        if !self.resources.lock().register_creation(resource) {
            trace!(context = %self.did, %resource, "creation already tracked");
        }
        if let Resource::Region(region) = resource {
            self.created_trees.write().insert(region.tree);
            self.notify_holders(Message::CreatedRegions {
                context: self.did,
                regions: vec![region],
            });
        }
        Ok(())
    }

    fn find_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> Result<PendingSets, ContextError> {
        let tree = self.equivalence_tree(requirement, bounds);
        let mut factory = self.set_factory();
        let lookup = tree.compute(bounds, mask, &mut factory);
        factory.finish()?;
        if lookup.remote.is_empty() {
            return Ok(PendingSets::new(
                lookup.local,
                None,
                Event::NO_EVENT,
                Arc::clone(&self.runtime),
            ));
        }
        let mut owners: BTreeMap<NodeId, (Rect, FieldMask)> = BTreeMap::new();
        for sub in lookup.remote {
            match owners.get_mut(&sub.owner) {
                Some((b, m)) => {
                    *b = bounding(b, &sub.bounds);
                    m.union_with(&sub.mask);
                }
                None => {
                    owners.insert(sub.owner, (sub.bounds, sub.mask));
                }
            }
        }
        let (request, ready) = self.runtime.reports().open(owners.keys().copied());
        for (owner, (b, m)) in owners {
            self.runtime.send(
                owner,
                Message::EqSetRequest {
                    context: self.did,
                    request,
                    requirement,
                    bounds: b,
                    mask: m,
                    reply_to: self.runtime.node(),
                },
            )?;
        }
        Ok(PendingSets::new(
            lookup.local,
            Some(request),
            ready,
            Arc::clone(&self.runtime),
        ))
    }

    fn barrier_for(&self, tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError> {
        self.strategy.barrier_for(tag)
    }
}

impl ResourceOwner for InnerContext {
    fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn strategy(&self) -> &Arc<dyn ReplicationStrategy> {
        &self.strategy
    }

    fn delete_resource(&self, resource: Resource) -> Result<DeletionOutcome, ContextError> {
        let spec = OpSpec::new(OpKind::Deletion).with_label(resource.to_string());
        let handle = self.issue_with(spec, |index| {
            self.deletions.lock().insert(index, resource);
        })?;
        if let Resource::Field(fs, fid) = resource {
            self.local_fields.lock().free(fs, fid);
        }
        Ok(self
            .resources
            .lock()
            .register_deletion(resource, handle.completed, &self.destroy))
    }

    fn share_resource(&self, resource: Resource) -> Result<u32, ContextError> {
        self.resources.lock().create_shared_ownership(resource)
    }

    fn on_field_allocated(&self, fs: FieldSpaceId, fid: FieldId, size: u32) {
        let info = self.local_fields.lock().allocate(fs, fid, size);
        self.notify_holders(Message::LocalFieldUpdate {
            context: self.did,
            field_space: fs,
            fields: vec![info],
        });
    }
}

impl PipelineHost for InnerContext {
    fn analyze_dependences(&self, op: &Arc<Operation>) -> Dependences {
        let index = op.index();
        match op.kind() {
            OpKind::Fence(kind) => {
                let waits = Event::all_settled(self.prior_incomplete(index, kind));
                let mut analysis = self.analysis.lock();
                let fenced = analysis.fences.perform_fence_analysis(index);
                analysis.fences.update_current_fence(
                    kind,
                    FenceRecord {
                        index,
                        mapped: op.mapped_event(),
                        completed: op.completion_event(),
                    },
                );
                match kind {
                    FenceKind::Mapping => Dependences {
                        mapping: Event::merge([fenced.mapping, waits]),
                        execution: fenced.execution,
                    },
                    FenceKind::Execution => {
                        analysis.deps.clear();
                        Dependences {
                            mapping: fenced.mapping,
                            execution: Event::merge([fenced.execution, waits]),
                        }
                    }
                }
            }
            OpKind::Frame => {
                let waits = Event::all_settled(self.prior_incomplete(index, FenceKind::Execution));
                let fenced = self.analysis.lock().fences.perform_fence_analysis(index);
                Dependences {
                    mapping: fenced.mapping,
                    execution: Event::merge([fenced.execution, waits]),
                }
            }
            OpKind::Deletion => {
                let resource = self.deletions.lock().remove(&index);
                let analysis = self.analysis.lock();
                let fenced = analysis.fences.perform_fence_analysis(index);
                let users = resource
                    .map(|r| analysis.deps.analyze_deletion(&r))
                    .unwrap_or_default();
                Dependences {
                    mapping: Event::merge([fenced.mapping, users.mapping]),
                    execution: Event::merge([fenced.execution, users.execution]),
                }
            }
            _ => {
                let mut analysis = self.analysis.lock();
                let fenced = analysis.fences.perform_fence_analysis(index);
                let users = analysis.deps.analyze(
                    index,
                    &op.requirements(),
                    &op.mapped_event(),
                    &op.completion_event(),
                );
                Dependences {
                    mapping: Event::merge([fenced.mapping, users.mapping]),
                    execution: Event::merge([fenced.execution, users.execution]),
                }
            }
        }
    }

    fn on_executed(&self, op: &Arc<Operation>) {
        self.children
            .lock()
            .rob
            .update(op.index(), ChildStage::Executed);
    }

    fn on_completed(&self, op: &Arc<Operation>) {
        self.children
            .lock()
            .rob
            .update(op.index(), ChildStage::Completed);
        self.window.release();
        if op.kind() == OpKind::Frame {
            self.frames.release();
        }
        if op.is_poisoned() {
            self.metrics.record_poisoned();
        }
    }

    fn on_committed(&self, op: &Arc<Operation>) {
        let retired = {
            let mut children = self.children.lock();
            children.rob.update(op.index(), ChildStage::Committed);
            children.rob.retire()
        };
        self.metrics.record_committed();
        if !retired.is_empty() {
            trace!(context = %self.did, retired = retired.len(), "children retired");
        }
    }

    fn on_post_end(&self, op: &Arc<Operation>) {
        self.retired.lock().push(Arc::clone(op));
    }
}

impl ContextHandler for InnerContext {
    fn handle_message(&self, from: NodeId, msg: Message) {
        match msg {
            Message::EqSetRequest {
                request,
                requirement,
                bounds,
                mask,
                reply_to,
                ..
            } => self.answer_eq_request(request, requirement, &bounds, &mask, reply_to),
            Message::RemoteRelease { context } => {
                self.remote_holders.lock().remove(&from);
                match self.runtime.ledger().remove_remote(context, from) {
                    Ok(Release::Reclaimed) => self.runtime.unregister_context(context),
                    Ok(Release::Retained) => {}
                    Err(e) => warn!(%context, %from, error = %e, "unexpected remote release"),
                }
            }
            Message::CollectiveView {
                action: ViewAction::Release,
                view,
                ..
            } => match self.runtime.ledger().remove_remote(view, from) {
                Ok(Release::Reclaimed) => {
                    self.views.lock().remove(&view);
                    debug!(context = %self.did, %view, "collective view reclaimed");
                }
                Ok(Release::Retained) => {}
                Err(e) => warn!(%view, %from, error = %e, "unexpected view release"),
            },
            Message::LocalFieldUpdate {
                field_space,
                fields,
                ..
            } => {
                let added = self.local_fields.lock().record_remote(field_space, &fields);
                trace!(context = %self.did, %field_space, added, "remote local fields recorded");
            }
            Message::CreatedRegions { regions, .. } => {
                self.created_trees
                    .write()
                    .extend(regions.iter().map(|r| r.tree));
            }
            other => warn!(
                context = %self.did,
                kind = %other.kind(),
                %from,
                "message not handled by an inner context"
            ),
        }
    }
}

impl fmt::Debug for InnerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerContext")
            .field("did", &self.did)
            .field("depth", &self.depth)
            .field("shard", &self.strategy.shard())
            .field("outstanding", &self.window.outstanding())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ── Behaviors ──────────────────────────────────────────────────────

struct TaskBehavior {
    parent: Weak<InnerContext>,
    launcher: TaskLauncher,
}

impl TaskBehavior {
    fn child(&self, parent: &Arc<InnerContext>) -> Result<Context, ContextError> {
        let reqs = self.launcher.requirements.clone();
        let args = self.launcher.args.clone();
        if self.launcher.leaf {
            Ok(Context::Leaf(LeafContext::new(parent, reqs, args, None)))
        } else {
            Ok(Context::Inner(InnerContext::child(parent, reqs, args, None)?))
        }
    }
}

impl OpBehavior for TaskBehavior {
    fn execute(&self, op: &Operation) -> Execution {
        let Some(parent) = self.parent.upgrade() else {
            warn!(op = %op.index(), "parent context dropped before the task ran");
            return Execution {
                effects: Event::poisoned(),
                value: None,
            };
        };
        let task = self.launcher.task;
        let child = match self.child(&parent) {
            Ok(c) => c,
            Err(e) => {
                error!(%task, error = %e, "child context not created");
                return Execution {
                    effects: Event::poisoned(),
                    value: None,
                };
            }
        };
        run_body(&self.launcher.body, &child, task)
    }
}

fn run_body(body: &TaskBody, child: &Context, task: weft_core::TaskId) -> Execution {
    let result = body(child);
    let ended = child.end_task();
    match (result, ended) {
        (Ok(value), Ok(done)) => Execution {
            effects: done,
            value: Some(value),
        },
        (Err(e), _) | (Ok(_), Err(e)) => {
            error!(%task, error = %e, "task failed");
            Execution {
                effects: Event::poisoned(),
                value: None,
            }
        }
    }
}

struct IndexBehavior {
    parent: Weak<InnerContext>,
    requirements: Vec<RegionRequirement>,
    body: TaskBody,
    args: Vec<u8>,
    points: Vec<Point>,
    map: FutureMap,
}

impl OpBehavior for IndexBehavior {
    fn execute(&self, op: &Operation) -> Execution {
        let Some(parent) = self.parent.upgrade() else {
            return Execution {
                effects: Event::poisoned(),
                value: None,
            };
        };
        let mut ran = 0usize;
        for (linear, point) in self.points.iter().enumerate() {
            if !parent.strategy.owns_point(linear) {
                continue;
            }
            let Some(future) = self.map.get(point) else {
                continue;
            };
            let child = Context::Leaf(LeafContext::new(
                &parent,
                self.requirements.clone(),
                self.args.clone(),
                Some(point.clone()),
            ));
            let result = (self.body)(&child);
            let ended = child.end_task();
            match (result, ended) {
                (Ok(value), Ok(_)) => {
                    future.set(value);
                }
                (Err(e), _) | (Ok(_), Err(e)) => {
                    warn!(op = %op.index(), ?point, error = %e, "index point failed");
                    future.poison();
                }
            }
            ran += 1;
        }
        trace!(op = %op.index(), ran, "index points executed");
        Execution::default()
    }
}

struct ArriveBehavior {
    runtime: Arc<Runtime>,
    barrier: PhaseBarrier,
    count: usize,
    value: Option<Vec<u8>>,
    arrive: bool,
    wait: bool,
}

impl OpBehavior for ArriveBehavior {
    fn execute(&self, op: &Operation) -> Execution {
        let substrate = self.runtime.substrate();
        let event = if self.wait {
            match substrate.event(self.barrier) {
                Ok(ev) => ev,
                Err(e) => {
                    error!(op = %op.index(), barrier = %self.barrier, error = %e, "barrier lost");
                    return Execution {
                        effects: Event::poisoned(),
                        value: None,
                    };
                }
            }
        } else {
            Event::NO_EVENT
        };
        if self.arrive {
            if let Err(e) = substrate.arrive_with(self.barrier, self.count, self.value.clone()) {
                error!(op = %op.index(), barrier = %self.barrier, error = %e, "arrival rejected");
                return Execution {
                    effects: Event::poisoned(),
                    value: None,
                };
            }
        }
        Execution {
            effects: event,
            value: None,
        }
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<InnerContext>();
    assert::<DynamicCollective>();
};
