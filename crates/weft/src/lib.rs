//! weft: the execution-context layer of a distributed task runtime.
//!
//! This is the facade crate that re-exports the public API of the weft
//! sub-crates. For most users, adding `weft` as a single dependency is
//! sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use weft::prelude::*;
//!
//! let pool = WorkerPool::new(2).unwrap();
//! let runtime = Runtime::new(NodeId(0), ContextConfig::default(), Arc::new(pool)).unwrap();
//!
//! let body: TaskBody = Arc::new(|ctx: &Context| {
//!     let owner = ctx.resources("setup")?;
//!     let is = owner.create_index_space(Rect::line(0, 99))?;
//!     let fs = owner.create_field_space()?;
//!     owner.allocate_field(fs, 8)?;
//!     let region = owner.create_logical_region(is, fs)?;
//!
//!     ctx.fill_fields(RegionRequirement::read_write(region, FieldMask::first_n(1)), &[7])?;
//!     let child = ctx.execute_task(TaskLauncher::new(TaskId(1), |_| Ok(vec![42])))?;
//!     Ok(child.get().unwrap_or_default())
//! });
//!
//! let value = TopLevelContext::run(runtime, &body).unwrap();
//! assert_eq!(value, vec![42]);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `weft-core` | Ids, field masks, events, phase barriers, errors |
//! | [`pipeline`] | `weft-pipeline` | Operations, stage queues, reorder buffer, schedulers |
//! | [`eqset`] | `weft-eqset` | Rectangles, equivalence-set trees, ownership ledger |
//! | [`context`] | `weft-context` | Contexts, runtime, resource tracking, replication |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Identifiers, field masks, events and errors (`weft-core`).
///
/// [`types::Event`] and [`types::UserEvent`] are the completion handles
/// every operation exposes; [`types::BarrierSubstrate`] holds the phase
/// barriers shards meet on.
pub use weft_core as types;

/// The operation pipeline (`weft-pipeline`).
///
/// [`pipeline::OpSpec`] describes an operation to issue;
/// [`pipeline::WorkerPool`] and [`pipeline::ManualScheduler`] run the
/// pipeline's meta-tasks.
pub use weft_pipeline as pipeline;

/// Equivalence sets (`weft-eqset`).
///
/// [`eqset::EqKDRoot`] answers which sets cover a rectangle and field mask.
pub use weft_eqset as eqset;

/// Task contexts and the node runtime (`weft-context`).
///
/// Start from [`context::TopLevelContext`] or
/// [`context::launch_replicated`].
pub use weft_context as context;

/// Common imports for typical weft usage.
///
/// ```rust
/// use weft::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use weft_core::{
        ContextError, Event, FieldMask, LogicalRegion, NodeId, PhaseBarrier, ShardId, TaskId,
        TraceId, UserEvent,
    };

    // Pipeline
    pub use weft_pipeline::{
        Future, ManualScheduler, OpKind, OpSpec, Predicate, Privilege, RegionRequirement,
        WorkerPool,
    };

    // Equivalence sets
    pub use weft_eqset::Rect;

    // Contexts
    pub use weft_context::{
        launch_replicated, Context, ContextConfig, IndexLauncher, LeakPolicy, ReplicationConfig,
        ResourceOwner, Runtime, TaskBody, TaskContext, TaskLauncher, TopLevelContext,
    };
}
