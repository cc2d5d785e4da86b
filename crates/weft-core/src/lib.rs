//! Core types for the weft execution-context layer.
//!
//! This is the leaf crate of the workspace. It defines typed identifiers,
//! the [`FieldMask`] bitset, the error taxonomy shared by every context, and
//! the in-process event and phase-barrier substrate the pipeline and the
//! replication protocol are built on.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod barrier;
pub mod error;
pub mod event;
pub mod id;
pub mod mask;

pub use barrier::{BarrierSubstrate, PhaseBarrier, SubstrateConfig};
pub use error::{
    ContextError, Poisoned, ProtocolError, ResourceError, ResourceKind, SubstrateError,
};
pub use event::{Event, UserEvent};
pub use id::{
    CollectiveId, ContextIndex, DistributedId, FieldId, FieldSpaceId, GenerationId,
    IndexPartitionId, IndexSpaceId, LogicalRegion, MapperId, NodeId, Point, ProjectionId,
    ReductionOpId, RegionTreeId, ShardId, ShardingId, TaskId, TraceId, UniqueOpId,
};
pub use mask::FieldMask;
