//! The region forest seam.
//!
//! Index spaces, field spaces and logical regions live in a region forest
//! the context only drives through [`RegionForest`]. Identifiers are
//! allocated by the context (deterministically under replication) and
//! handed to the forest; the forest never picks ids itself.
//!
//! [`InMemoryForest`] is the forest used by [`crate::Runtime`] when no
//! other is supplied.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};
use weft_core::{FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, LogicalRegion};
use weft_eqset::Rect;

use crate::resources::Resource;

/// Region-forest operations the context calls.
///
/// Creation calls are idempotent: every shard of a replicated task issues
/// them with the same identifiers.
pub trait RegionForest: Send + Sync {
    /// Create an index space over `bounds`.
    fn create_index_space(&self, id: IndexSpaceId, bounds: Rect);

    /// Create a partition of `parent` into the given subspaces.
    fn create_partition(
        &self,
        id: IndexPartitionId,
        parent: IndexSpaceId,
        subspaces: &[IndexSpaceId],
    );

    /// Bounds of an index space, if it exists.
    fn index_space_bounds(&self, id: IndexSpaceId) -> Option<Rect>;

    /// Subspaces of a partition, in color order.
    fn partition_subspaces(&self, id: IndexPartitionId) -> Option<Vec<IndexSpaceId>>;

    /// Create an empty field space.
    fn create_field_space(&self, id: FieldSpaceId);

    /// Allocate a field of `size` bytes.
    fn allocate_field(&self, fs: FieldSpaceId, fid: FieldId, size: u32);

    /// Create a logical region tree.
    fn create_region(&self, region: LogicalRegion);

    /// Destroy a resource. Called exactly once per destroyed resource.
    fn destroy(&self, resource: &Resource);
}

/// Split `bounds` into `colors` pieces of near-equal extent along its
/// first dimension.
///
/// Earlier pieces take the remainder. When there are more colors than
/// points the trailing pieces are empty.
pub fn equal_split(bounds: &Rect, colors: usize) -> Vec<Rect> {
    if colors == 0 {
        return Vec::new();
    }
    let extent = if bounds.is_empty() {
        0
    } else {
        bounds.hi[0] - bounds.lo[0] + 1
    };
    let colors_i = colors as i64;
    let (base, extra) = (extent / colors_i, extent % colors_i);
    let mut lo = bounds.lo[0];
    (0..colors_i)
        .map(|c| {
            let len = base + i64::from(c < extra);
            let mut piece = bounds.clone();
            piece.lo[0] = lo;
            piece.hi[0] = lo + len - 1;
            lo += len;
            piece
        })
        .collect()
}

// ── InMemoryForest ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ForestState {
    index_spaces: HashMap<IndexSpaceId, Rect>,
    partitions: HashMap<IndexPartitionId, (IndexSpaceId, Vec<IndexSpaceId>)>,
    field_spaces: HashMap<FieldSpaceId, Vec<(FieldId, u32)>>,
    regions: Vec<LogicalRegion>,
    destroyed: Vec<Resource>,
}

/// Region forest kept in process memory.
///
/// Records every destruction in order so callers can check that each
/// resource is destroyed once.
#[derive(Debug, Default)]
pub struct InMemoryForest {
    state: Mutex<ForestState>,
}

impl InMemoryForest {
    /// Empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every destroyed resource, in destruction order.
    pub fn destroyed(&self) -> Vec<Resource> {
        self.state.lock().destroyed.clone()
    }

    /// How many times `resource` was destroyed.
    pub fn destroy_count(&self, resource: &Resource) -> usize {
        self.state
            .lock()
            .destroyed
            .iter()
            .filter(|r| *r == resource)
            .count()
    }

    /// Fields of a field space, in allocation order.
    pub fn fields(&self, fs: FieldSpaceId) -> Vec<(FieldId, u32)> {
        self.state
            .lock()
            .field_spaces
            .get(&fs)
            .cloned()
            .unwrap_or_default()
    }

    /// Live logical regions.
    pub fn regions(&self) -> Vec<LogicalRegion> {
        self.state.lock().regions.clone()
    }
}

impl RegionForest for InMemoryForest {
    fn create_index_space(&self, id: IndexSpaceId, bounds: Rect) {
        trace!(space = %id, %bounds, "index space created");
        self.state.lock().index_spaces.insert(id, bounds);
    }

    fn create_partition(
        &self,
        id: IndexPartitionId,
        parent: IndexSpaceId,
        subspaces: &[IndexSpaceId],
    ) {
        trace!(partition = %id, parent = %parent, colors = subspaces.len(), "partition created");
        self.state
            .lock()
            .partitions
            .insert(id, (parent, subspaces.to_vec()));
    }

    fn index_space_bounds(&self, id: IndexSpaceId) -> Option<Rect> {
        self.state.lock().index_spaces.get(&id).cloned()
    }

    fn partition_subspaces(&self, id: IndexPartitionId) -> Option<Vec<IndexSpaceId>> {
        self.state.lock().partitions.get(&id).map(|(_, s)| s.clone())
    }

    fn create_field_space(&self, id: FieldSpaceId) {
        self.state.lock().field_spaces.entry(id).or_default();
    }

    fn allocate_field(&self, fs: FieldSpaceId, fid: FieldId, size: u32) {
        let mut st = self.state.lock();
        let fields = st.field_spaces.entry(fs).or_default();
        if !fields.iter().any(|(f, _)| *f == fid) {
            fields.push((fid, size));
        }
    }

    fn create_region(&self, region: LogicalRegion) {
        let mut st = self.state.lock();
        if !st.regions.contains(&region) {
            st.regions.push(region);
        }
    }

    fn destroy(&self, resource: &Resource) {
        debug!(%resource, "destroyed");
        let mut st = self.state.lock();
        match resource {
            Resource::Region(r) => st.regions.retain(|x| x.tree != r.tree),
            Resource::Field(fs, fid) => {
                if let Some(fields) = st.field_spaces.get_mut(fs) {
                    fields.retain(|(f, _)| f != fid);
                }
            }
            Resource::FieldSpace(fs) => {
                st.field_spaces.remove(fs);
            }
            Resource::IndexSpace(is) => {
                st.index_spaces.remove(is);
            }
            Resource::IndexPartition(ip) => {
                st.partitions.remove(ip);
            }
        }
        st.destroyed.push(*resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn equal_split_spreads_remainder_first() {
        let pieces = equal_split(&Rect::line(0, 9), 3);
        assert_eq!(
            pieces,
            vec![Rect::line(0, 3), Rect::line(4, 6), Rect::line(7, 9)]
        );
    }

    #[test]
    fn more_colors_than_points_gives_empty_tail() {
        let pieces = equal_split(&Rect::line(5, 6), 4);
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.iter().filter(|p| p.is_empty()).count(), 2);
    }

    #[test]
    fn destroy_is_logged() {
        let f = InMemoryForest::new();
        f.create_field_space(FieldSpaceId(1));
        f.allocate_field(FieldSpaceId(1), FieldId(0), 8);
        f.allocate_field(FieldSpaceId(1), FieldId(0), 8);
        assert_eq!(f.fields(FieldSpaceId(1)), vec![(FieldId(0), 8)]);
        let fs = Resource::FieldSpace(FieldSpaceId(1));
        f.destroy(&fs);
        assert_eq!(f.destroy_count(&fs), 1);
        assert!(f.fields(FieldSpaceId(1)).is_empty());
    }

    proptest! {
        #[test]
        fn equal_split_tiles_bounds(lo in -50i64..50, len in 0i64..200, colors in 1usize..20) {
            let bounds = Rect::line(lo, lo + len - 1);
            let pieces = equal_split(&bounds, colors);
            prop_assert_eq!(pieces.len(), colors);
            let total: u64 = pieces.iter().map(Rect::volume).sum();
            prop_assert_eq!(total, bounds.volume());
            for w in pieces.windows(2) {
                prop_assert!(!w[0].intersects(&w[1]));
            }
            let max = pieces.iter().map(Rect::volume).max().unwrap_or(0);
            let min = pieces.iter().map(Rect::volume).min().unwrap_or(0);
            prop_assert!(max - min <= 1);
        }
    }
}
