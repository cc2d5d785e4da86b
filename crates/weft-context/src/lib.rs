//! Task execution contexts for weft.
//!
//! A task body issues sub-operations through the [`Context`] it receives.
//! The [`InnerContext`] numbers them, runs dependence analysis, throttles
//! the issuing thread and drives each operation through the operation
//! pipeline. It also tracks the region-tree resources the task creates and
//! deletes and hands them to the parent when the task ends.
//!
//! The other variants specialize it: a [`LeafContext`] launches nothing, a
//! [`RemoteContext`] is a proxy on a node that does not own the context,
//! and a [`ReplicateContext`] runs one shard of a control-replicated task,
//! keeping the shards in lockstep through named barriers and collectives.
//!
//! Nodes talk through the [`Runtime`], which owns the id allocators, the
//! barrier substrate, the equivalence-set ownership ledger and the message
//! dispatcher. A [`Cluster`] wires several runtimes together in-process.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod context;
pub mod deps;
pub mod fence;
pub mod fields;
pub mod forest;
pub mod futures;
pub mod hash;
pub mod inner;
pub mod launcher;
pub mod leaf;
pub mod message;
pub mod metrics;
pub mod regions;
pub mod registry;
pub mod remote;
pub mod replicate;
pub mod resources;
pub mod runtime;
pub mod throttle;
pub mod toplevel;
pub mod trace;
pub mod transport;
pub mod wire;

pub use config::{ConfigError, ContextConfig, LeakPolicy, ReplicationConfig};
pub use context::{
    Context, NoReplication, OpHandle, PendingSets, ReplicationStrategy, TaskContext,
};
pub use forest::{InMemoryForest, RegionForest};
pub use futures::FutureMap;
pub use inner::{DynamicCollective, InnerContext, InnerParams};
pub use launcher::{IndexLauncher, TaskBody, TaskLauncher};
pub use leaf::LeafContext;
pub use message::{Message, MessageKind};
pub use metrics::{ContextMetrics, MetricsSnapshot};
pub use regions::ResourceOwner;
pub use registry::{Deliver, Delivery, PendingRegistry};
pub use remote::{unpack_remote_context, PackedContext, RemoteContext};
pub use replicate::barrier::{BarrierKey, BarrierTag};
pub use replicate::shard::{ShardManager, ShardedStrategy};
pub use replicate::ReplicateContext;
pub use resources::{DeletionOutcome, Resource, ReturnedResources};
pub use runtime::{Cluster, ContextHandler, IdKind, Runtime, RuntimeParts, SUM_U64};
pub use toplevel::{launch_replicated, TopLevelContext};
pub use trace::TraceOutcome;
