//! Operations, region requirements, and operation behaviors.
//!
//! An [`Operation`] is shared behind an `Arc` between its context, the
//! pipeline queues and the reorder buffer. Its identity (kind, requirements,
//! behavior) lives in an [`OpSpec`]; its lifecycle (stage, events, result)
//! is reset when the slot is recycled, which also bumps the generation so
//! that outstanding [`OpRef`] handles detect the reuse.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use weft_core::{
    ContextIndex, Event, FieldMask, GenerationId, LogicalRegion, ReductionOpId, UniqueOpId,
    UserEvent,
};

use crate::future::{Future, Predicate};
use crate::stage::{ChildStage, Stage};

// ── Kinds ──────────────────────────────────────────────────────────

/// Which kind of fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceKind {
    /// Later operations may not map before earlier ones have mapped.
    Mapping,
    /// Later operations may not execute before earlier ones complete.
    Execution,
}

/// Trace boundary marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TraceBoundary {
    /// `begin_trace`.
    Begin,
    /// `end_trace`.
    End,
}

/// What an operation does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Single task launch.
    Task,
    /// Index-space task launch.
    IndexTask,
    /// Fill of fields with a value.
    Fill,
    /// Region-to-region copy.
    Copy,
    /// Mapping or execution fence.
    Fence(FenceKind),
    /// Deletion of a region-tree resource.
    Deletion,
    /// Creation of a region-tree resource.
    Creation,
    /// Partitioning operation.
    Partition,
    /// Trace boundary.
    Trace(TraceBoundary),
    /// Phase-barrier or dynamic-collective arrival.
    PhaseBarrier,
    /// Predicate evaluation.
    Predicate,
    /// Frame marker.
    Frame,
    /// Attach of external data.
    Attach,
    /// Detach of external data.
    Detach,
}

impl OpKind {
    /// Whether the operation passes through the task stages.
    pub fn is_task(self) -> bool {
        matches!(self, OpKind::Task | OpKind::IndexTask)
    }

    /// Stable name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Task => "task",
            OpKind::IndexTask => "index-task",
            OpKind::Fill => "fill",
            OpKind::Copy => "copy",
            OpKind::Fence(FenceKind::Mapping) => "mapping-fence",
            OpKind::Fence(FenceKind::Execution) => "execution-fence",
            OpKind::Deletion => "deletion",
            OpKind::Creation => "creation",
            OpKind::Partition => "partition",
            OpKind::Trace(TraceBoundary::Begin) => "begin-trace",
            OpKind::Trace(TraceBoundary::End) => "end-trace",
            OpKind::PhaseBarrier => "phase-barrier",
            OpKind::Predicate => "predicate",
            OpKind::Frame => "frame",
            OpKind::Attach => "attach",
            OpKind::Detach => "detach",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Region requirements ────────────────────────────────────────────

/// Access privilege of a region requirement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// No access; only names the region.
    NoAccess,
    /// Read.
    ReadOnly,
    /// Read and write.
    ReadWrite,
    /// Write without reading prior contents.
    WriteDiscard,
    /// Reduction with the given operator.
    Reduce(ReductionOpId),
}

impl Privilege {
    /// Whether the privilege modifies data.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Privilege::ReadWrite | Privilege::WriteDiscard | Privilege::Reduce(_)
        )
    }

    /// Whether an access with `later` must wait for an earlier access with
    /// `self` to the same data.
    ///
    /// Writes conflict with everything, reads conflict with prior writes,
    /// and reductions only conflict with reductions of a different operator.
    pub fn conflicts(self, later: Privilege) -> bool {
        match (self, later) {
            (Privilege::NoAccess, _) | (_, Privilege::NoAccess) => false,
            (Privilege::ReadOnly, Privilege::ReadOnly) => false,
            (Privilege::Reduce(a), Privilege::Reduce(b)) => a != b,
            _ => self.is_write() || later.is_write(),
        }
    }

    /// Whether a task holding `self` may grant `child` to a sub-operation.
    pub fn covers(self, child: Privilege) -> bool {
        match (self, child) {
            (_, Privilege::NoAccess) => true,
            (Privilege::ReadWrite, _) => true,
            (Privilege::WriteDiscard, _) => true,
            (Privilege::ReadOnly, Privilege::ReadOnly) => true,
            (Privilege::Reduce(a), Privilege::Reduce(b)) => a == b,
            _ => false,
        }
    }
}

/// A region, a set of its fields, and the privilege requested on them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRequirement {
    /// Region accessed.
    pub region: LogicalRegion,
    /// Region of the parent task the privilege derives from.
    pub parent: LogicalRegion,
    /// Fields accessed.
    pub fields: FieldMask,
    /// Access privilege.
    pub privilege: Privilege,
}

impl RegionRequirement {
    /// Requirement on `region` whose parent is the region itself.
    pub fn new(region: LogicalRegion, fields: FieldMask, privilege: Privilege) -> Self {
        Self {
            region,
            parent: region,
            fields,
            privilege,
        }
    }

    /// Read-only requirement.
    pub fn read_only(region: LogicalRegion, fields: FieldMask) -> Self {
        Self::new(region, fields, Privilege::ReadOnly)
    }

    /// Read-write requirement.
    pub fn read_write(region: LogicalRegion, fields: FieldMask) -> Self {
        Self::new(region, fields, Privilege::ReadWrite)
    }

    /// Override the parent region.
    pub fn with_parent(mut self, parent: LogicalRegion) -> Self {
        self.parent = parent;
        self
    }
}

// ── Behaviors ──────────────────────────────────────────────────────

/// Outcome of executing an operation.
#[derive(Clone, Debug, Default)]
pub struct Execution {
    /// Triggers when the operation's effects are finished.
    pub effects: Event,
    /// Return value delivered to the operation's future.
    pub value: Option<Vec<u8>>,
}

impl Execution {
    /// Effects finished immediately with a return value.
    pub fn value(bytes: Vec<u8>) -> Self {
        Self {
            effects: Event::NO_EVENT,
            value: Some(bytes),
        }
    }
}

/// Pluggable effects of an operation.
///
/// The pipeline calls these from meta-tasks with no context lock held.
pub trait OpBehavior: Send + Sync {
    /// Launch the operation's effects.
    fn execute(&self, _op: &Operation) -> Execution {
        Execution::default()
    }

    /// Pick the processor a task runs on.
    fn select_processor(&self, _op: &Operation) -> u32 {
        0
    }

    /// Whether the task stays on the local node.
    fn distribute(&self, _op: &Operation) -> bool {
        true
    }

    /// Called once the task is launched on its processor.
    fn launch(&self, _op: &Operation) {}
}

/// Behavior with no effects.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEffects;

impl OpBehavior for NoEffects {}

/// Behavior backed by a closure producing the return value.
pub struct FnBehavior<F>(pub F);

impl<F> OpBehavior for FnBehavior<F>
where
    F: Fn(&Operation) -> Execution + Send + Sync,
{
    fn execute(&self, op: &Operation) -> Execution {
        (self.0)(op)
    }
}

// ── OpSpec ─────────────────────────────────────────────────────────

/// Identity of an operation: what it is and what it touches.
#[derive(Clone)]
pub struct OpSpec {
    /// Operation kind.
    pub kind: OpKind,
    /// Region requirements.
    pub requirements: Vec<RegionRequirement>,
    /// Effects.
    pub behavior: Arc<dyn OpBehavior>,
    /// Optional predicate; effects are skipped when it resolves false.
    pub predicate: Option<Predicate>,
    /// Value delivered to the future when the predicate is false.
    pub false_value: Vec<u8>,
    /// Free-form label for logs and trace capture.
    pub label: Option<String>,
}

impl OpSpec {
    /// Spec with no requirements and no effects.
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            requirements: Vec::new(),
            behavior: Arc::new(NoEffects),
            predicate: None,
            false_value: Vec::new(),
            label: None,
        }
    }

    /// Add a region requirement.
    pub fn with_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }

    /// Set the behavior.
    pub fn with_behavior(mut self, behavior: Arc<dyn OpBehavior>) -> Self {
        self.behavior = behavior;
        self
    }

    /// Predicate the operation.
    pub fn with_predicate(mut self, predicate: Predicate, false_value: Vec<u8>) -> Self {
        self.predicate = Some(predicate);
        self.false_value = false_value;
        self
    }

    /// Attach a label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for OpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSpec")
            .field("kind", &self.kind)
            .field("requirements", &self.requirements.len())
            .field("predicated", &self.predicate.is_some())
            .field("label", &self.label)
            .finish()
    }
}

// ── Operation ──────────────────────────────────────────────────────

struct Lifecycle {
    unique_id: UniqueOpId,
    index: ContextIndex,
    stage: Stage,
    child: ChildStage,
    mapped: UserEvent,
    completion: UserEvent,
    commit: UserEvent,
    mapping_pre: Event,
    execution_pre: Event,
    effects: Event,
    result: Future,
    value: Option<Vec<u8>>,
    processor: u32,
    predicated_false: bool,
    poisoned: bool,
}

impl Lifecycle {
    fn new(index: ContextIndex) -> Self {
        Self {
            unique_id: UniqueOpId::next(),
            index,
            stage: Stage::Prepipeline,
            child: ChildStage::Executing,
            mapped: UserEvent::new(),
            completion: UserEvent::new(),
            commit: UserEvent::new(),
            mapping_pre: Event::NO_EVENT,
            execution_pre: Event::NO_EVENT,
            effects: Event::NO_EVENT,
            result: Future::pending(),
            value: None,
            processor: 0,
            predicated_false: false,
            poisoned: false,
        }
    }
}

/// A unit of work issued by a context.
pub struct Operation {
    generation: AtomicU64,
    spec: RwLock<OpSpec>,
    life: Mutex<Lifecycle>,
}

impl Operation {
    /// Create an operation at `index`.
    pub fn new(index: ContextIndex, spec: OpSpec) -> Arc<Self> {
        Arc::new(Self {
            generation: AtomicU64::new(0),
            spec: RwLock::new(spec),
            life: Mutex::new(Lifecycle::new(index)),
        })
    }

    /// Reuse this slot for a new operation.
    ///
    /// Returns the new generation. Handles taken before the call become
    /// stale.
    pub fn recycle(&self, index: ContextIndex, spec: OpSpec) -> GenerationId {
        *self.spec.write() = spec;
        *self.life.lock() = Lifecycle::new(index);
        GenerationId(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Current generation.
    pub fn generation(&self) -> GenerationId {
        GenerationId(self.generation.load(Ordering::Acquire))
    }

    /// Runtime-wide unique id of the current generation.
    pub fn unique_id(&self) -> UniqueOpId {
        self.life.lock().unique_id
    }

    /// Position in the issuing context's stream.
    pub fn index(&self) -> ContextIndex {
        self.life.lock().index
    }

    /// Operation kind.
    pub fn kind(&self) -> OpKind {
        self.spec.read().kind
    }

    /// Clone of the region requirements.
    pub fn requirements(&self) -> Vec<RegionRequirement> {
        self.spec.read().requirements.clone()
    }

    /// The behavior.
    pub fn behavior(&self) -> Arc<dyn OpBehavior> {
        Arc::clone(&self.spec.read().behavior)
    }

    /// The predicate, if any.
    pub fn predicate(&self) -> Option<Predicate> {
        self.spec.read().predicate.clone()
    }

    /// Label, if any.
    pub fn label(&self) -> Option<String> {
        self.spec.read().label.clone()
    }

    /// Current pipeline stage.
    pub fn stage(&self) -> Stage {
        self.life.lock().stage
    }

    /// Current lifecycle state.
    pub fn child_stage(&self) -> ChildStage {
        self.life.lock().child
    }

    /// Triggered once the operation has mapped.
    pub fn mapped_event(&self) -> Event {
        self.life.lock().mapped.event()
    }

    /// Triggered once the operation's effects are finished. Poisoned when
    /// the operation was poisoned.
    pub fn completion_event(&self) -> Event {
        self.life.lock().completion.event()
    }

    /// Triggered once the operation has committed.
    pub fn commit_event(&self) -> Event {
        self.life.lock().commit.event()
    }

    /// Mapping precondition computed by dependence analysis.
    pub fn mapping_precondition(&self) -> Event {
        self.life.lock().mapping_pre.clone()
    }

    /// Execution precondition computed by dependence analysis.
    pub fn execution_precondition(&self) -> Event {
        self.life.lock().execution_pre.clone()
    }

    /// Future resolved at post-end.
    pub fn result(&self) -> Future {
        self.life.lock().result.clone()
    }

    /// Processor chosen at enqueue.
    pub fn processor(&self) -> u32 {
        self.life.lock().processor
    }

    /// Whether the effects were skipped because the predicate was false.
    pub fn predicated_false(&self) -> bool {
        self.life.lock().predicated_false
    }

    /// Whether the operation was poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.life.lock().poisoned
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        let mut life = self.life.lock();
        debug_assert!(stage >= life.stage, "operation moved backwards");
        life.stage = stage;
    }

    pub(crate) fn set_child_stage(&self, child: ChildStage) {
        self.life.lock().child = child;
    }

    pub(crate) fn set_preconditions(&self, mapping: Event, execution: Event) {
        let mut life = self.life.lock();
        life.mapping_pre = mapping;
        life.execution_pre = execution;
    }

    pub(crate) fn set_processor(&self, processor: u32) {
        self.life.lock().processor = processor;
    }

    pub(crate) fn set_predicated_false(&self) {
        self.life.lock().predicated_false = true;
    }

    pub(crate) fn set_poisoned(&self) {
        self.life.lock().poisoned = true;
    }

    pub(crate) fn set_effects(&self, effects: Event, value: Option<Vec<u8>>) {
        let mut life = self.life.lock();
        life.effects = effects;
        life.value = value;
    }

    pub(crate) fn effects(&self) -> Event {
        self.life.lock().effects.clone()
    }

    pub(crate) fn take_value(&self) -> Option<Vec<u8>> {
        self.life.lock().value.take()
    }

    pub(crate) fn false_value(&self) -> Vec<u8> {
        self.spec.read().false_value.clone()
    }

    pub(crate) fn trigger_mapped(&self) {
        let ev = self.life.lock().mapped.clone();
        ev.trigger();
    }

    pub(crate) fn trigger_completion(&self, poisoned: bool) {
        let ev = self.life.lock().completion.clone();
        if poisoned {
            ev.poison();
        } else {
            ev.trigger();
        }
    }

    pub(crate) fn trigger_commit(&self) {
        let ev = self.life.lock().commit.clone();
        ev.trigger();
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let life = self.life.lock();
        f.debug_struct("Operation")
            .field("index", &life.index)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("kind", &self.spec.read().kind)
            .field("stage", &life.stage)
            .field("child", &life.child)
            .finish()
    }
}

// ── OpRef ──────────────────────────────────────────────────────────

/// Generation-checked handle to an operation.
#[derive(Clone)]
pub struct OpRef {
    op: Arc<Operation>,
    generation: GenerationId,
}

impl OpRef {
    /// Handle to the current generation of `op`.
    pub fn new(op: &Arc<Operation>) -> Self {
        Self {
            op: Arc::clone(op),
            generation: op.generation(),
        }
    }

    /// The operation, if its slot has not been recycled since.
    pub fn get(&self) -> Option<&Arc<Operation>> {
        (!self.is_stale()).then_some(&self.op)
    }

    /// Whether the slot has been recycled.
    pub fn is_stale(&self) -> bool {
        self.op.generation() != self.generation
    }

    /// Generation captured by the handle.
    pub fn generation(&self) -> GenerationId {
        self.generation
    }
}

impl fmt::Debug for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRef")
            .field("generation", &self.generation)
            .field("stale", &self.is_stale())
            .finish()
    }
}

// ── OperationPool ──────────────────────────────────────────────────

/// Free list of retired operation slots.
pub struct OperationPool {
    free: Mutex<Vec<Arc<Operation>>>,
    capacity: usize,
}

impl OperationPool {
    /// Pool keeping at most `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Operation at `index`, reusing a free slot when one exists.
    pub fn acquire(&self, index: ContextIndex, spec: OpSpec) -> Arc<Operation> {
        let slot = self.free.lock().pop();
        match slot {
            Some(op) => {
                op.recycle(index, spec);
                op
            }
            None => Operation::new(index, spec),
        }
    }

    /// Return a retired operation. Slots still referenced elsewhere are
    /// dropped instead of pooled.
    pub fn release(&self, op: Arc<Operation>) {
        if Arc::strong_count(&op) != 1 {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(op);
        }
    }

    /// Number of free slots.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Operation>();
    assert::<OpRef>();
    assert::<OperationPool>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{FieldId, FieldSpaceId, IndexSpaceId, RegionTreeId};

    fn region() -> LogicalRegion {
        LogicalRegion {
            tree: RegionTreeId(1),
            index_space: IndexSpaceId(1),
            field_space: FieldSpaceId(1),
        }
    }

    #[test]
    fn privilege_conflicts() {
        use Privilege::*;
        assert!(!ReadOnly.conflicts(ReadOnly));
        assert!(ReadWrite.conflicts(ReadOnly));
        assert!(ReadOnly.conflicts(WriteDiscard));
        assert!(!Reduce(ReductionOpId(1)).conflicts(Reduce(ReductionOpId(1))));
        assert!(Reduce(ReductionOpId(1)).conflicts(Reduce(ReductionOpId(2))));
        assert!(!NoAccess.conflicts(ReadWrite));
    }

    #[test]
    fn privilege_coverage() {
        use Privilege::*;
        assert!(ReadWrite.covers(ReadOnly));
        assert!(!ReadOnly.covers(ReadWrite));
        assert!(!Reduce(ReductionOpId(1)).covers(ReadOnly));
    }

    #[test]
    fn recycle_stales_handles() {
        let req = RegionRequirement::read_only(region(), [FieldId(0)].into_iter().collect());
        let op = Operation::new(ContextIndex(0), OpSpec::new(OpKind::Fill).with_requirement(req));
        let r = OpRef::new(&op);
        let uid = op.unique_id();
        assert!(r.get().is_some());
        op.recycle(ContextIndex(5), OpSpec::new(OpKind::Copy));
        assert!(r.is_stale());
        assert!(r.get().is_none());
        assert_eq!(op.index(), ContextIndex(5));
        assert_eq!(op.kind(), OpKind::Copy);
        assert_ne!(op.unique_id(), uid);
        assert!(op.requirements().is_empty());
    }

    #[test]
    fn pool_reuses_unreferenced_slots() {
        let pool = OperationPool::new(4);
        let op = pool.acquire(ContextIndex(0), OpSpec::new(OpKind::Fill));
        let keep = Arc::clone(&op);
        pool.release(op);
        assert_eq!(pool.free_len(), 0);
        pool.release(keep);
        assert_eq!(pool.free_len(), 1);
        let again = pool.acquire(ContextIndex(1), OpSpec::new(OpKind::Task));
        assert_eq!(again.generation(), GenerationId(1));
        assert_eq!(pool.free_len(), 0);
    }

    #[test]
    fn task_kinds() {
        assert!(OpKind::Task.is_task());
        assert!(OpKind::IndexTask.is_task());
        assert!(!OpKind::Fill.is_task());
        assert_eq!(OpKind::Fence(FenceKind::Mapping).to_string(), "mapping-fence");
    }
}
