//! Equivalence sets.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use weft_core::{DistributedId, FieldMask, NodeId};

use crate::rect::Rect;

/// Authoritative consistency-tracking object for a sub-region and a set of
/// fields.
///
/// The set itself only records identity and placement; which fields it is
/// responsible for at a given point is recorded by the tree leaves that
/// reference it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EquivalenceSet {
    /// Distributed id.
    pub did: DistributedId,
    /// Node holding the authoritative copy.
    pub owner: NodeId,
    /// Region the set was created for.
    pub bounds: Rect,
}

impl EquivalenceSet {
    /// New set.
    pub fn new(did: DistributedId, owner: NodeId, bounds: Rect) -> Self {
        Self { did, owner, bounds }
    }
}

impl fmt::Display for EquivalenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eqset {} on node {} over {}", self.did, self.owner, self.bounds)
    }
}

/// An equivalence set together with the fields of a query it covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetOverlap {
    /// The set.
    pub set: Arc<EquivalenceSet>,
    /// Fields of the query the set is responsible for.
    pub mask: FieldMask,
}

/// Collapse overlaps naming the same set, merging their masks.
///
/// First-seen order is preserved.
pub fn merge_by_did<I>(overlaps: I) -> Vec<SetOverlap>
where
    I: IntoIterator<Item = SetOverlap>,
{
    let mut merged: IndexMap<DistributedId, SetOverlap> = IndexMap::new();
    for o in overlaps {
        match merged.get_mut(&o.set.did) {
            Some(existing) => existing.mask.union_with(&o.mask),
            None => {
                merged.insert(o.set.did, o);
            }
        }
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::FieldId;

    fn overlap(did: u64, fields: &[u32]) -> SetOverlap {
        SetOverlap {
            set: Arc::new(EquivalenceSet::new(
                DistributedId(did),
                NodeId(0),
                Rect::line(0, 9),
            )),
            mask: fields.iter().copied().map(FieldId).collect(),
        }
    }

    #[test]
    fn merge_unions_masks_in_first_seen_order() {
        let merged = merge_by_did([overlap(2, &[0]), overlap(1, &[1]), overlap(2, &[3])]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].set.did, DistributedId(2));
        assert_eq!(
            merged[0].mask,
            [FieldId(0), FieldId(3)].into_iter().collect::<FieldMask>()
        );
    }
}
