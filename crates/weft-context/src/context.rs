//! The context capability and its closed set of variants.
//!
//! Every context a task body can hold implements [`TaskContext`]: it issues
//! operations, tracks the resources it creates, finds equivalence sets and
//! names the barrier of a synchronization point. [`Context`] is the handle
//! task bodies receive; it dispatches each call to the variant behind it
//! and rejects calls the variant cannot serve. What differs between a
//! single-shard and a replicated inner context is injected through a
//! [`ReplicationStrategy`].

use std::fmt;
use std::sync::Arc;

use weft_core::{
    ContextError, ContextIndex, DistributedId, Event, FieldMask, PhaseBarrier, ShardId, TraceId,
};
use weft_eqset::{merge_by_did, Rect, SetOverlap};
use weft_pipeline::{Future, OpSpec, Predicate, RegionRequirement};

use crate::futures::FutureMap;
use crate::inner::InnerContext;
use crate::launcher::{IndexLauncher, TaskLauncher};
use crate::leaf::LeafContext;
use crate::regions::ResourceOwner;
use crate::remote::RemoteContext;
use crate::replicate::barrier::BarrierTag;
use crate::replicate::ReplicateContext;
use crate::resources::Resource;
use crate::runtime::{IdKind, Runtime};
use crate::trace::TraceOutcome;

// ── Handles ────────────────────────────────────────────────────────

/// Handle to an issued operation.
#[derive(Clone, Debug)]
pub struct OpHandle {
    /// Position in the issuing context's stream.
    pub index: ContextIndex,
    /// Triggers once the operation has mapped.
    pub mapped: Event,
    /// Triggers once the operation's effects are finished.
    pub completed: Event,
    /// The operation's result.
    pub future: Future,
}

/// Equivalence sets of a query, some of which may still be on their way
/// from remote owners.
pub struct PendingSets {
    local: Vec<SetOverlap>,
    request: Option<u64>,
    ready: Event,
    runtime: Arc<Runtime>,
}

impl PendingSets {
    pub(crate) fn new(
        local: Vec<SetOverlap>,
        request: Option<u64>,
        ready: Event,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            local,
            request,
            ready,
            runtime,
        }
    }

    /// Triggers once every remote owner has replied.
    pub fn ready_event(&self) -> Event {
        self.ready.clone()
    }

    /// Whether every remote owner has replied.
    pub fn is_ready(&self) -> bool {
        self.ready.has_triggered()
    }

    /// Park until every owner has replied and return the sets, one entry
    /// per set.
    pub fn wait(self) -> Result<Vec<SetOverlap>, ContextError> {
        let _ = self.ready.wait();
        let mut sets = self.local;
        if let Some(request) = self.request {
            let remote = self
                .runtime
                .reports()
                .take(request)
                .map_err(|e| ContextError::IllegalCall {
                    call: "find_equivalence_sets",
                    reason: e.to_string(),
                })?
                .unwrap_or_default();
            sets.extend(remote);
        }
        Ok(merge_by_did(sets))
    }
}

impl fmt::Debug for PendingSets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSets")
            .field("local", &self.local.len())
            .field("request", &self.request)
            .field("ready", &self.ready.has_triggered())
            .finish()
    }
}

// ── Capabilities ───────────────────────────────────────────────────

/// What every context can be asked to do.
pub trait TaskContext: Send + Sync {
    /// Issue an operation into the context's stream.
    fn issue_operation(&self, spec: OpSpec) -> Result<OpHandle, ContextError>;

    /// Record a resource created on behalf of the context.
    fn track_resource(&self, resource: Resource) -> Result<(), ContextError>;

    /// Equivalence sets of region requirement `requirement` overlapping
    /// `bounds` for `mask`.
    fn find_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> Result<PendingSets, ContextError>;

    /// Next barrier generation of a synchronization point, or `None` when
    /// the context does not synchronize with peers.
    fn barrier_for(&self, tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError>;
}

/// Behavior that differs between a context running alone and one shard of
/// a replicated launch. The defaults describe a context running alone.
pub trait ReplicationStrategy: Send + Sync {
    /// This shard.
    fn shard(&self) -> ShardId {
        ShardId(0)
    }

    /// Shards in the launch.
    fn total_shards(&self) -> usize {
        1
    }

    /// Whether this shard performs effects that must happen once.
    fn is_primary(&self) -> bool {
        self.shard() == ShardId(0)
    }

    /// A globally unique identifier of `kind`.
    fn allocate(&self, runtime: &Runtime, kind: IdKind) -> Result<u64, ContextError> {
        Ok(runtime.allocate(kind))
    }

    /// See [`TaskContext::barrier_for`].
    fn barrier_for(&self, _tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError> {
        Ok(None)
    }

    /// Barrier created by the application, expecting `arrivals`.
    fn create_barrier(
        &self,
        runtime: &Runtime,
        arrivals: usize,
    ) -> Result<PhaseBarrier, ContextError> {
        Ok(runtime.substrate().create_barrier(arrivals))
    }

    /// Fold an API call into the replay-determinism hash.
    fn record_call(&self, _call: &'static str) {}

    /// Shard that creates the next equivalence set.
    fn next_equivalence_set_origin(&self) -> ShardId {
        self.shard()
    }

    /// Identifier of a new equivalence set created by dependence analysis.
    fn equivalence_set_id(&self, runtime: &Runtime) -> Result<DistributedId, ContextError> {
        Ok(DistributedId(runtime.allocate(IdKind::EquivalenceSet)))
    }

    /// Whether this shard runs point `linear` of an index launch.
    fn owns_point(&self, _linear: usize) -> bool {
        true
    }
}

/// Strategy of a context that runs alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReplication;

impl ReplicationStrategy for NoReplication {}

// ── Context ────────────────────────────────────────────────────────

/// The context handed to a task body.
#[derive(Clone)]
pub enum Context {
    /// Root of a task tree.
    TopLevel(Arc<InnerContext>),
    /// Context of a task that may launch children.
    Inner(Arc<InnerContext>),
    /// Context of a leaf task.
    Leaf(Arc<LeafContext>),
    /// Proxy of a context owned by another node.
    Remote(Arc<RemoteContext>),
    /// One shard of a control-replicated task.
    Replicate(Arc<ReplicateContext>),
}

impl Context {
    /// The inner context serving `call`, or the error the variant raises.
    pub fn inner(&self, call: &'static str) -> Result<&Arc<InnerContext>, ContextError> {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => Ok(c),
            Self::Replicate(c) => Ok(c.inner()),
            Self::Leaf(_) => Err(ContextError::LeafOperation { call }),
            Self::Remote(_) => Err(ContextError::IllegalCall {
                call,
                reason: "remote contexts only answer equivalence-set queries".into(),
            }),
        }
    }

    /// The replicated context, if this is one.
    pub fn replicate(&self) -> Option<&Arc<ReplicateContext>> {
        match self {
            Self::Replicate(c) => Some(c),
            _ => None,
        }
    }

    /// Resource creation and deletion.
    pub fn resources(&self, call: &'static str) -> Result<&dyn ResourceOwner, ContextError> {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => Ok(c.as_ref()),
            Self::Replicate(c) => Ok(c.inner().as_ref()),
            Self::Leaf(c) => Ok(c.as_ref()),
            Self::Remote(_) => Err(ContextError::IllegalCall {
                call,
                reason: "remote contexts do not own resources".into(),
            }),
        }
    }

    /// Short name of the variant.
    pub fn variant(&self) -> &'static str {
        match self {
            Self::TopLevel(_) => "top-level",
            Self::Inner(_) => "inner",
            Self::Leaf(_) => "leaf",
            Self::Remote(_) => "remote",
            Self::Replicate(_) => "replicate",
        }
    }

    fn capability(&self) -> &dyn TaskContext {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => c.as_ref(),
            Self::Leaf(c) => c.as_ref(),
            Self::Remote(c) => c.as_ref(),
            Self::Replicate(c) => c.inner().as_ref(),
        }
    }

    /// Arguments of the running task.
    pub fn args(&self) -> Vec<u8> {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => c.args().to_vec(),
            Self::Replicate(c) => c.inner().args().to_vec(),
            Self::Leaf(c) => c.args().to_vec(),
            Self::Remote(_) => Vec::new(),
        }
    }

    /// Launch point of the running task, for index-launch points.
    pub fn point(&self) -> Option<weft_core::Point> {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => c.point().cloned(),
            Self::Replicate(c) => c.inner().point().cloned(),
            Self::Leaf(c) => c.point().cloned(),
            Self::Remote(_) => None,
        }
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Launch a child task.
    pub fn execute_task(&self, launcher: TaskLauncher) -> Result<Future, ContextError> {
        match self {
            Self::Replicate(c) => c.execute_task(launcher),
            _ => self.inner("execute_task")?.execute_task(launcher),
        }
    }

    /// Launch one child task per point of a domain.
    pub fn execute_index_space(&self, launcher: IndexLauncher) -> Result<FutureMap, ContextError> {
        self.inner("execute_index_space")?.execute_index_space(launcher)
    }

    /// Fill `requirement`'s fields with `value`.
    pub fn fill_fields(
        &self,
        requirement: RegionRequirement,
        value: &[u8],
    ) -> Result<OpHandle, ContextError> {
        self.inner("fill_fields")?.fill_fields(requirement, value)
    }

    /// Copy `src` into `dst`.
    pub fn issue_copy(
        &self,
        src: RegionRequirement,
        dst: RegionRequirement,
    ) -> Result<OpHandle, ContextError> {
        self.inner("issue_copy")?.issue_copy(src, dst)
    }

    /// Order mapping of later operations after every earlier one.
    pub fn issue_mapping_fence(&self) -> Result<OpHandle, ContextError> {
        self.inner("issue_mapping_fence")?.issue_mapping_fence()
    }

    /// Order later operations after every earlier one completes.
    pub fn issue_execution_fence(&self) -> Result<OpHandle, ContextError> {
        self.inner("issue_execution_fence")?.issue_execution_fence()
    }

    /// Mark a frame boundary, parking while too many frames are in flight.
    pub fn issue_frame(&self) -> Result<OpHandle, ContextError> {
        self.inner("issue_frame")?.issue_frame()
    }

    /// Start recording `trace`.
    pub fn begin_trace(&self, trace: TraceId) -> Result<(), ContextError> {
        self.inner("begin_trace")?.begin_trace(trace)
    }

    /// Stop recording `trace`.
    pub fn end_trace(&self, trace: TraceId) -> Result<TraceOutcome, ContextError> {
        match self {
            Self::Replicate(c) => c.end_trace(trace),
            _ => self.inner("end_trace")?.end_trace(trace),
        }
    }

    /// Predicate backed by `future`; any non-zero byte reads as true.
    pub fn create_predicate(&self, future: &Future) -> Result<Predicate, ContextError> {
        self.inner("create_predicate")?.create_predicate(future)
    }

    /// Future already holding `bytes`. Allowed in every context.
    pub fn from_value(&self, bytes: impl Into<Vec<u8>>) -> Future {
        Future::from_value(bytes)
    }

    /// End the running task. Returns the event triggered once every child
    /// has completed.
    pub fn end_task(&self) -> Result<Event, ContextError> {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => c.end_task(),
            Self::Replicate(c) => c.end_task(),
            Self::Leaf(c) => c.end_task(),
            Self::Remote(c) => {
                c.release()?;
                Ok(Event::NO_EVENT)
            }
        }
    }
}

impl TaskContext for Context {
    fn issue_operation(&self, spec: OpSpec) -> Result<OpHandle, ContextError> {
        self.capability().issue_operation(spec)
    }

    fn track_resource(&self, resource: Resource) -> Result<(), ContextError> {
        self.capability().track_resource(resource)
    }

    fn find_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> Result<PendingSets, ContextError> {
        self.capability()
            .find_equivalence_sets(requirement, bounds, mask)
    }

    fn barrier_for(&self, tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError> {
        self.capability().barrier_for(tag)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TopLevel(c) | Self::Inner(c) => f
                .debug_tuple(self.variant())
                .field(&c.did())
                .finish(),
            Self::Leaf(c) => f.debug_tuple("leaf").field(&c.depth()).finish(),
            Self::Remote(c) => f.debug_tuple("remote").field(&c.did()).finish(),
            Self::Replicate(c) => f
                .debug_tuple("replicate")
                .field(&c.inner().did())
                .field(&c.shard())
                .finish(),
        }
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Context>();
    assert::<OpHandle>();
    assert::<PendingSets>();
};
