//! Error types for weft contexts.
//!
//! Organized by the failure taxonomy of the context layer: programming and
//! privilege errors raised at issue time, poisoned execution, resource
//! accounting errors, and distributed protocol violations.

use std::error::Error;
use std::fmt;

use crate::id::{CollectiveId, LogicalRegion, NodeId, ShardId};

/// Kind of region-tree resource tracked by a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// A logical region.
    Region,
    /// A field within a field space.
    Field,
    /// A field space.
    FieldSpace,
    /// An index space.
    IndexSpace,
    /// An index partition.
    IndexPartition,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Region => write!(f, "logical region"),
            Self::Field => write!(f, "field"),
            Self::FieldSpace => write!(f, "field space"),
            Self::IndexSpace => write!(f, "index space"),
            Self::IndexPartition => write!(f, "index partition"),
        }
    }
}

/// Marker error: an upstream operation failed and this result is poisoned.
///
/// Poison is never raised eagerly; it surfaces when the application
/// observes a future whose producing operation had poisoned preconditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Poisoned;

impl fmt::Display for Poisoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "result poisoned by an upstream failure")
    }
}

impl Error for Poisoned {}

/// Resource accounting errors found by `report_leaks_and_duplicates`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceError {
    /// A resource was deleted more times than it was shared.
    DuplicateDeletion {
        /// Kind of resource.
        kind: ResourceKind,
        /// Raw identifier of the resource.
        id: u64,
    },
    /// Resources created by the context were never returned or destroyed.
    Leaked {
        /// Kind of resource.
        kind: ResourceKind,
        /// Raw identifiers of the leaked resources.
        ids: Vec<u64>,
    },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateDeletion { kind, id } => {
                write!(f, "duplicate deletion of {kind} {id}")
            }
            Self::Leaked { kind, ids } => {
                write!(f, "{} leaked {kind}(s): {ids:?}", ids.len())
            }
        }
    }
}

impl Error for ResourceError {}

/// Errors raised by the barrier substrate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubstrateError {
    /// The barrier was never created or has been destroyed.
    UnknownBarrier {
        /// Raw barrier id.
        id: u64,
    },
    /// More arrivals were recorded than the barrier expects.
    Overarrival {
        /// Raw barrier id.
        id: u64,
        /// Generation that was over-arrived.
        generation: u32,
        /// Expected arrival count.
        expected: usize,
    },
    /// The barrier settled every generation and was reclaimed; its
    /// contributions are gone.
    Reclaimed {
        /// Raw barrier id.
        id: u64,
    },
}

impl fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBarrier { id } => write!(f, "unknown barrier {id}"),
            Self::Overarrival {
                id,
                generation,
                expected,
            } => write!(
                f,
                "barrier {id} generation {generation} received more than {expected} arrivals"
            ),
            Self::Reclaimed { id } => write!(f, "barrier {id} has been reclaimed"),
        }
    }
}

impl Error for SubstrateError {}

/// Violations of the control-replication protocol.
///
/// All of these are fatal: replication correctness assumes every shard
/// issues an identical call sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Two consecutive barrier generations could not be paired.
    BarrierMismatch {
        /// Name of the barrier pool.
        pool: &'static str,
        /// Description of the mismatch.
        detail: String,
    },
    /// Too many messages buffered for a target that never registered.
    UnregisteredTarget {
        /// Registry that buffered the messages.
        registry: &'static str,
        /// Key of the missing target.
        key: String,
        /// Number of buffered messages when the bound was hit.
        buffered: usize,
    },
    /// A target was registered twice under the same key.
    DuplicateTarget {
        /// Registry the target was registered with.
        registry: &'static str,
        /// The duplicated key.
        key: String,
    },
    /// A collective completed with contributions it cannot interpret.
    Malformed {
        /// Collective the payload belonged to.
        collective: CollectiveId,
        /// Description of the problem.
        detail: String,
    },
    /// Shards issued different call sequences.
    Divergence {
        /// First shard observed to diverge.
        shard: ShardId,
        /// Name of the call that diverged.
        call: &'static str,
    },
    /// A peer mailbox was closed while a message was in flight.
    Disconnected {
        /// Shard whose mailbox was closed.
        shard: ShardId,
    },
    /// A message could not be handed to a node.
    Undeliverable {
        /// Destination node.
        node: NodeId,
        /// Why delivery failed.
        detail: String,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BarrierMismatch { pool, detail } => {
                write!(f, "barrier mismatch in pool '{pool}': {detail}")
            }
            Self::UnregisteredTarget {
                registry,
                key,
                buffered,
            } => write!(
                f,
                "{buffered} messages buffered for unregistered {registry} target {key}"
            ),
            Self::DuplicateTarget { registry, key } => {
                write!(f, "{registry} target {key} registered twice")
            }
            Self::Malformed { collective, detail } => {
                write!(f, "malformed payload in collective {collective}: {detail}")
            }
            Self::Divergence { shard, call } => {
                write!(f, "shard {shard} diverged at call '{call}'")
            }
            Self::Disconnected { shard } => write!(f, "shard {shard} mailbox disconnected"),
            Self::Undeliverable { node, detail } => {
                write!(f, "message to node {node} undeliverable: {detail}")
            }
        }
    }
}

impl Error for ProtocolError {}

/// Errors returned by context operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextError {
    /// The requested operation accesses data the task holds no privilege on.
    PrivilegeViolation {
        /// API call that was rejected.
        call: &'static str,
        /// Region named by the rejected requirement.
        region: LogicalRegion,
        /// Why the requirement is not covered.
        reason: String,
    },
    /// A resource handle does not name a live resource of this context.
    UnknownResource {
        /// Kind of resource.
        kind: ResourceKind,
        /// Raw identifier.
        id: u64,
    },
    /// A leaf task attempted an operation that spawns children.
    LeafOperation {
        /// API call that was rejected.
        call: &'static str,
    },
    /// An API call was made in an illegal state (e.g. nested traces).
    IllegalCall {
        /// API call that was rejected.
        call: &'static str,
        /// Description of the illegal state.
        reason: String,
    },
    /// The context has already ended.
    ContextEnded,
    /// Resource accounting failed.
    Resource(ResourceError),
    /// The replication protocol was violated.
    Protocol(ProtocolError),
    /// The barrier substrate rejected a request.
    Substrate(SubstrateError),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivilegeViolation {
                call,
                region,
                reason,
            } => write!(f, "privilege violation in {call} on region {region}: {reason}"),
            Self::UnknownResource { kind, id } => write!(f, "unknown {kind} {id}"),
            Self::LeafOperation { call } => {
                write!(f, "illegal {call} call performed in a leaf task")
            }
            Self::IllegalCall { call, reason } => write!(f, "illegal {call} call: {reason}"),
            Self::ContextEnded => write!(f, "context has already ended"),
            Self::Resource(e) => write!(f, "resource: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Substrate(e) => write!(f, "substrate: {e}"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Resource(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Substrate(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ResourceError> for ContextError {
    fn from(e: ResourceError) -> Self {
        Self::Resource(e)
    }
}

impl From<ProtocolError> for ContextError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<SubstrateError> for ContextError {
    fn from(e: SubstrateError) -> Self {
        Self::Substrate(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{FieldSpaceId, IndexSpaceId, RegionTreeId};

    #[test]
    fn source_chains_to_layer_error() {
        let e: ContextError = ResourceError::DuplicateDeletion {
            kind: ResourceKind::FieldSpace,
            id: 4,
        }
        .into();
        assert!(e.source().is_some());
        assert_eq!(
            e.to_string(),
            "resource: duplicate deletion of field space 4"
        );
    }

    #[test]
    fn privilege_violation_names_region() {
        let e = ContextError::PrivilegeViolation {
            call: "fill_fields",
            region: LogicalRegion {
                tree: RegionTreeId(1),
                index_space: IndexSpaceId(2),
                field_space: FieldSpaceId(3),
            },
            reason: "no write privilege".into(),
        };
        assert!(e.to_string().contains("(1,2,3)"));
        assert!(e.source().is_none());
    }
}
