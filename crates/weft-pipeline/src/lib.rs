//! Operation pipeline for weft contexts.
//!
//! Every sub-operation a task issues is an [`Operation`] advanced through a
//! fixed sequence of [`Stage`]s by the [`OperationPipeline`]. Each stage is
//! a [`WorkQueue`] whose entries become drainable when their readiness
//! event triggers; draining happens in meta-tasks run by a [`Scheduler`],
//! so no worker thread ever blocks on an event. The [`ReorderBuffer`]
//! retires committed operations strictly in issue order.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod future;
pub mod operation;
pub mod pipeline;
pub mod queue;
pub mod reorder;
pub mod sched;
pub mod stage;

pub use future::{Future, Predicate};
pub use operation::{
    Execution, FenceKind, FnBehavior, NoEffects, OpBehavior, OpKind, OpRef, OpSpec, Operation,
    OperationPool, Privilege, RegionRequirement, TraceBoundary,
};
pub use pipeline::{Dependences, OperationPipeline, PipelineHost};
pub use queue::{Discipline, Drained, WorkQueue};
pub use reorder::{ReorderBuffer, ReorderBufferEntry, StageCounts};
pub use sched::{ManualScheduler, MetaTask, Scheduler, WorkerPool};
pub use stage::{ChildStage, Stage};
