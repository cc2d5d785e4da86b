//! Strongly-typed identifiers and the [`Point`] coordinate alias.

use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

define_id!(
    /// Position of an operation within the stream issued by one context.
    ///
    /// Assigned in issue order; no two live operations of a context share one.
    ContextIndex(u64)
);

define_id!(
    /// Generation of an operation slot. Recycled slots get a fresh generation
    /// so stale handles can be detected.
    GenerationId(u64)
);

define_id!(
    /// Runtime-wide unique identifier of an operation.
    UniqueOpId(u64)
);

define_id!(
    /// Identifier of a distributed object (contexts, equivalence sets, views).
    DistributedId(u64)
);

define_id!(
    /// Index of a shard within a control-replicated launch.
    ShardId(u32)
);

define_id!(
    /// Address space (node) identifier.
    NodeId(u32)
);

define_id!(
    /// Identifier of a shard collective. Even values come from the
    /// application call path, odd values from logical analysis.
    CollectiveId(u64)
);

define_id!(
    /// Identifier of an index space.
    IndexSpaceId(u64)
);

define_id!(
    /// Identifier of an index partition.
    IndexPartitionId(u64)
);

define_id!(
    /// Identifier of a field space.
    FieldSpaceId(u64)
);

define_id!(
    /// Identifier of a field within a field space.
    FieldId(u32)
);

define_id!(
    /// Identifier of a region tree.
    RegionTreeId(u64)
);

define_id!(
    /// Identifier of a trace.
    TraceId(u64)
);

define_id!(
    /// Identifier of a task.
    TaskId(u64)
);

define_id!(
    /// Identifier of a mapper.
    MapperId(u64)
);

define_id!(
    /// Identifier of a projection functor.
    ProjectionId(u64)
);

define_id!(
    /// Identifier of a sharding functor.
    ShardingId(u64)
);

define_id!(
    /// Identifier of a reduction operator.
    ReductionOpId(u32)
);

/// A logical region: the cross product of an index space and a field space
/// within one region tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalRegion {
    /// Region tree the region belongs to.
    pub tree: RegionTreeId,
    /// Index space of the region.
    pub index_space: IndexSpaceId,
    /// Field space of the region.
    pub field_space: FieldSpaceId,
}

impl fmt::Display for LogicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{})",
            self.tree, self.index_space, self.field_space
        )
    }
}

/// Counter for unique [`UniqueOpId`] allocation.
static UNIQUE_OP_COUNTER: AtomicU64 = AtomicU64::new(1);

impl UniqueOpId {
    /// Allocate a fresh, process-wide unique operation id. Thread-safe.
    pub fn next() -> Self {
        Self(UNIQUE_OP_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl ShardId {
    /// Shard id as a `usize` index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl CollectiveId {
    /// Whether this id was assigned during logical dependence analysis.
    pub fn is_logical(self) -> bool {
        self.0 % 2 == 1
    }
}

/// A point in an index space.
///
/// Uses `SmallVec<[i64; 3]>` to avoid heap allocation for spaces up to
/// three dimensions.
pub type Point = SmallVec<[i64; 3]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_op_ids_are_distinct() {
        let a = UniqueOpId::next();
        let b = UniqueOpId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn collective_parity() {
        assert!(!CollectiveId(4).is_logical());
        assert!(CollectiveId(7).is_logical());
    }

    #[test]
    fn logical_region_display() {
        let r = LogicalRegion {
            tree: RegionTreeId(1),
            index_space: IndexSpaceId(2),
            field_space: FieldSpaceId(3),
        };
        assert_eq!(r.to_string(), "(1,2,3)");
    }
}
