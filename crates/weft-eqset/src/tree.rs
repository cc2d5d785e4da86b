//! KD-tree index from sub-regions to equivalence sets.
//!
//! Each leaf of an [`EqKDTree`] covers a rectangle and holds the sets
//! responsible for it, each with a field mask; masks within a leaf are
//! disjoint and the leaves partition the root rectangle, so every
//! (point, field) pair has at most one responsible set.
//!
//! Trees grow lazily. A query that finds fields with no responsible set
//! splits the leaf toward the query bounds and creates new sets only for
//! the part that the query covers. Splitting copies the parent's sets into
//! both children, so existing responsibilities are unchanged.
//!
//! Subtrees may be owned by another node; queries that reach them report a
//! [`RemoteSubtree`] instead of local sets.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;
use weft_core::{FieldId, FieldMask, NodeId};

use crate::rect::Rect;
use crate::set::{merge_by_did, EquivalenceSet, SetOverlap};

/// Creates equivalence sets for newly covered rectangles.
pub trait SetFactory {
    /// New set responsible for `bounds`.
    fn create(&mut self, bounds: &Rect) -> Arc<EquivalenceSet>;
}

impl<F> SetFactory for F
where
    F: FnMut(&Rect) -> Arc<EquivalenceSet>,
{
    fn create(&mut self, bounds: &Rect) -> Arc<EquivalenceSet> {
        self(bounds)
    }
}

/// Part of a query answered by another node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSubtree {
    /// Owner of the subtree.
    pub owner: NodeId,
    /// Part of the query inside the subtree.
    pub bounds: Rect,
    /// Fields queried.
    pub mask: FieldMask,
}

/// Result of a tree query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EqSetLookup {
    /// Local sets with the query fields they cover, one entry per set.
    pub local: Vec<SetOverlap>,
    /// Parts of the query owned by other nodes.
    pub remote: Vec<RemoteSubtree>,
}

impl EqSetLookup {
    fn merged(mut self) -> Self {
        self.local = merge_by_did(self.local);
        self
    }
}

enum NodeKind {
    Leaf(Vec<SetOverlap>),
    Split(Box<[EqKDNode; 2]>),
    Remote(NodeId),
}

struct EqKDNode {
    bounds: Rect,
    kind: NodeKind,
}

impl EqKDNode {
    fn leaf(bounds: Rect, sets: Vec<SetOverlap>) -> Self {
        Self {
            bounds,
            kind: NodeKind::Leaf(sets),
        }
    }

    fn split(&mut self, dim: usize, at: i64) {
        let (lo, hi) = self.bounds.split(dim, at);
        let child_kind = |kind: &NodeKind| match kind {
            NodeKind::Leaf(sets) => NodeKind::Leaf(sets.clone()),
            NodeKind::Remote(owner) => NodeKind::Remote(*owner),
            NodeKind::Split(_) => unreachable!("only leaves split"),
        };
        let children = Box::new([
            EqKDNode {
                bounds: lo,
                kind: child_kind(&self.kind),
            },
            EqKDNode {
                bounds: hi,
                kind: child_kind(&self.kind),
            },
        ]);
        trace!(bounds = %self.bounds, dim, at, "leaf split");
        self.kind = NodeKind::Split(children);
    }

    /// Narrow toward `q` if this leaf only partly overlaps it. Returns
    /// whether a split happened.
    fn split_toward(&mut self, q: &Rect) -> bool {
        if matches!(self.kind, NodeKind::Split(_)) {
            return false;
        }
        match self.bounds.cut_toward(q) {
            Some((dim, at)) => {
                self.split(dim, at);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, q: &Rect, mask: &FieldMask, out: &mut EqSetLookup) -> bool {
        if !self.bounds.intersects(q) {
            return true;
        }
        match &self.kind {
            NodeKind::Leaf(sets) => {
                let mut covered = FieldMask::empty();
                for s in sets {
                    covered.union_with(&s.mask);
                }
                if !mask.is_subset(&covered) {
                    return false;
                }
                push_overlaps(sets, mask, out);
                true
            }
            NodeKind::Split(children) => children.iter().all(|c| c.lookup(q, mask, out)),
            NodeKind::Remote(owner) => {
                push_remote(*owner, &self.bounds, q, mask, out);
                true
            }
        }
    }

    fn compute(
        &mut self,
        q: &Rect,
        mask: &FieldMask,
        factory: &mut dyn SetFactory,
        out: &mut EqSetLookup,
    ) {
        if !self.bounds.intersects(q) {
            return;
        }
        if let NodeKind::Leaf(sets) = &self.kind {
            let mut missing = mask.clone();
            for s in sets {
                missing.subtract(&s.mask);
            }
            if !missing.is_empty() {
                self.split_toward(q);
            }
        }
        match &mut self.kind {
            NodeKind::Leaf(sets) => {
                let mut missing = mask.clone();
                for s in sets.iter() {
                    missing.subtract(&s.mask);
                }
                if !missing.is_empty() {
                    let set = factory.create(&self.bounds);
                    trace!(did = %set.did, bounds = %self.bounds, "equivalence set created");
                    sets.push(SetOverlap { set, mask: missing });
                }
                push_overlaps(sets, mask, out);
            }
            NodeKind::Split(children) => {
                for c in children.iter_mut() {
                    c.compute(q, mask, factory, out);
                }
            }
            NodeKind::Remote(owner) => push_remote(*owner, &self.bounds, q, mask, out),
        }
    }

    fn refine(
        &mut self,
        q: &Rect,
        mask: &FieldMask,
        factory: &mut dyn SetFactory,
        out: &mut EqSetLookup,
    ) {
        if !self.bounds.intersects(q) {
            return;
        }
        self.split_toward(q);
        match &mut self.kind {
            NodeKind::Leaf(sets) => {
                for s in sets.iter_mut() {
                    s.mask.subtract(mask);
                }
                sets.retain(|s| !s.mask.is_empty());
                let set = factory.create(&self.bounds);
                let overlap = SetOverlap {
                    set,
                    mask: mask.clone(),
                };
                sets.push(overlap.clone());
                out.local.push(overlap);
            }
            NodeKind::Split(children) => {
                for c in children.iter_mut() {
                    c.refine(q, mask, factory, out);
                }
            }
            NodeKind::Remote(owner) => push_remote(*owner, &self.bounds, q, mask, out),
        }
    }

    fn invalidate(&mut self, q: &Rect, mask: &FieldMask) -> usize {
        if !self.bounds.intersects(q) {
            return 0;
        }
        self.split_toward(q);
        match &mut self.kind {
            NodeKind::Leaf(sets) => {
                let mut touched = 0;
                for s in sets.iter_mut() {
                    if s.mask.overlaps(mask) {
                        s.mask.subtract(mask);
                        touched += 1;
                    }
                }
                sets.retain(|s| !s.mask.is_empty());
                touched
            }
            NodeKind::Split(children) => children.iter_mut().map(|c| c.invalidate(q, mask)).sum(),
            NodeKind::Remote(_) => 0,
        }
    }

    fn set_remote(&mut self, q: &Rect, owner: NodeId) {
        if !self.bounds.intersects(q) {
            return;
        }
        if q.contains(&self.bounds) {
            self.kind = NodeKind::Remote(owner);
            return;
        }
        self.split_toward(q);
        if let NodeKind::Split(children) = &mut self.kind {
            for c in children.iter_mut() {
                c.set_remote(q, owner);
            }
        }
    }

    fn responsible(&self, p: &[i64], field: FieldId, out: &mut Vec<Arc<EquivalenceSet>>) {
        if !self.bounds.contains_point(p) {
            return;
        }
        match &self.kind {
            NodeKind::Leaf(sets) => out.extend(
                sets.iter()
                    .filter(|s| s.mask.contains(field))
                    .map(|s| Arc::clone(&s.set)),
            ),
            NodeKind::Split(children) => {
                for c in children.iter() {
                    c.responsible(p, field, out);
                }
            }
            NodeKind::Remote(_) => {}
        }
    }

    fn leaves(&self) -> usize {
        match &self.kind {
            NodeKind::Split(children) => children.iter().map(|c| c.leaves()).sum(),
            _ => 1,
        }
    }
}

fn push_overlaps(sets: &[SetOverlap], mask: &FieldMask, out: &mut EqSetLookup) {
    for s in sets {
        let m = s.mask.intersection(mask);
        if !m.is_empty() {
            out.local.push(SetOverlap {
                set: Arc::clone(&s.set),
                mask: m,
            });
        }
    }
}

fn push_remote(owner: NodeId, bounds: &Rect, q: &Rect, mask: &FieldMask, out: &mut EqSetLookup) {
    out.remote.push(RemoteSubtree {
        owner,
        bounds: bounds.intersection(q),
        mask: mask.clone(),
    });
}

/// Equivalence-set index of one region requirement.
pub struct EqKDTree {
    root: EqKDNode,
}

impl EqKDTree {
    /// Empty tree over `bounds`.
    pub fn new(bounds: Rect) -> Self {
        Self {
            root: EqKDNode::leaf(bounds, Vec::new()),
        }
    }

    /// Root rectangle.
    pub fn bounds(&self) -> &Rect {
        &self.root.bounds
    }

    /// Answer `q` without modifying the tree.
    ///
    /// Returns `None` when some queried (point, field) pair has no set yet.
    pub fn lookup(&self, q: &Rect, mask: &FieldMask) -> Option<EqSetLookup> {
        let mut out = EqSetLookup::default();
        self.root
            .lookup(q, mask, &mut out)
            .then(|| out.merged())
    }

    /// Sets overlapping `q` for `mask`, creating sets for uncovered parts.
    pub fn compute(
        &mut self,
        q: &Rect,
        mask: &FieldMask,
        factory: &mut dyn SetFactory,
    ) -> EqSetLookup {
        let mut out = EqSetLookup::default();
        self.root.compute(q, mask, factory, &mut out);
        out.merged()
    }

    /// Move responsibility for `mask` inside `q` to new, finer sets.
    ///
    /// Returns the created sets; remote parts must be refined by their
    /// owners.
    pub fn refine(
        &mut self,
        q: &Rect,
        mask: &FieldMask,
        factory: &mut dyn SetFactory,
    ) -> EqSetLookup {
        let mut out = EqSetLookup::default();
        self.root.refine(q, mask, factory, &mut out);
        out
    }

    /// Drop responsibility for `mask` inside `q`. Returns the number of
    /// leaf entries touched.
    pub fn invalidate(&mut self, q: &Rect, mask: &FieldMask) -> usize {
        self.root.invalidate(q, mask)
    }

    /// Hand the part of the tree inside `q` to `owner`.
    pub fn set_remote(&mut self, q: &Rect, owner: NodeId) {
        self.root.set_remote(q, owner);
    }

    /// Sets responsible for `field` at point `p`.
    pub fn responsible(&self, p: &[i64], field: FieldId) -> Vec<Arc<EquivalenceSet>> {
        let mut out = Vec::new();
        self.root.responsible(p, field, &mut out);
        out
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.root.leaves()
    }
}

impl fmt::Debug for EqKDTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EqKDTree")
            .field("bounds", &self.root.bounds)
            .field("leaves", &self.leaf_count())
            .finish()
    }
}

/// Lock-guarded [`EqKDTree`].
///
/// Lookups that need no new sets share the read lock; creation,
/// refinement and invalidation take the write lock.
#[derive(Debug)]
pub struct EqKDRoot {
    tree: RwLock<EqKDTree>,
}

impl EqKDRoot {
    /// Root over `bounds`.
    pub fn new(bounds: Rect) -> Self {
        Self {
            tree: RwLock::new(EqKDTree::new(bounds)),
        }
    }

    /// See [`EqKDTree::compute`].
    pub fn compute(
        &self,
        q: &Rect,
        mask: &FieldMask,
        factory: &mut dyn SetFactory,
    ) -> EqSetLookup {
        if let Some(found) = self.tree.read().lookup(q, mask) {
            return found;
        }
        self.tree.write().compute(q, mask, factory)
    }

    /// See [`EqKDTree::refine`].
    pub fn refine(
        &self,
        q: &Rect,
        mask: &FieldMask,
        factory: &mut dyn SetFactory,
    ) -> EqSetLookup {
        self.tree.write().refine(q, mask, factory)
    }

    /// See [`EqKDTree::invalidate`].
    pub fn invalidate(&self, q: &Rect, mask: &FieldMask) -> usize {
        self.tree.write().invalidate(q, mask)
    }

    /// See [`EqKDTree::set_remote`].
    pub fn set_remote(&self, q: &Rect, owner: NodeId) {
        self.tree.write().set_remote(q, owner);
    }

    /// See [`EqKDTree::responsible`].
    pub fn responsible(&self, p: &[i64], field: FieldId) -> Vec<Arc<EquivalenceSet>> {
        self.tree.read().responsible(p, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use weft_core::DistributedId;

    struct Counter(u64);

    impl SetFactory for Counter {
        fn create(&mut self, bounds: &Rect) -> Arc<EquivalenceSet> {
            self.0 += 1;
            Arc::new(EquivalenceSet::new(
                DistributedId(self.0),
                NodeId(0),
                bounds.clone(),
            ))
        }
    }

    fn mask(ids: &[u32]) -> FieldMask {
        ids.iter().copied().map(FieldId).collect()
    }

    #[test]
    fn first_query_creates_set_for_query_only() {
        let mut t = EqKDTree::new(Rect::line(0, 99));
        let mut f = Counter(0);
        let r = t.compute(&Rect::line(10, 19), &mask(&[0]), &mut f);
        assert_eq!(r.local.len(), 1);
        assert_eq!(r.local[0].set.bounds, Rect::line(10, 19));
        assert!(t.responsible(&[5], FieldId(0)).is_empty());
        assert_eq!(t.responsible(&[15], FieldId(0)).len(), 1);
    }

    #[test]
    fn repeated_query_hits_read_path() {
        let root = EqKDRoot::new(Rect::line(0, 99));
        let mut f = Counter(0);
        let a = root.compute(&Rect::line(0, 99), &mask(&[0, 1]), &mut f);
        let b = root.compute(&Rect::line(20, 30), &mask(&[1]), &mut f);
        assert_eq!(f.0, 1);
        assert_eq!(a.local[0].set.did, b.local[0].set.did);
        assert_eq!(b.local[0].mask, mask(&[1]));
    }

    #[test]
    fn refine_moves_fields_to_finer_set() {
        let mut t = EqKDTree::new(Rect::line(0, 99));
        let mut f = Counter(0);
        t.compute(&Rect::line(0, 99), &mask(&[0, 1]), &mut f);
        let created = t.refine(&Rect::line(0, 49), &mask(&[0]), &mut f);
        assert_eq!(created.local.len(), 1);
        let fine = &created.local[0].set;
        assert_eq!(t.responsible(&[10], FieldId(0)), vec![Arc::clone(fine)]);
        // Field 1 stays with the coarse set; the upper half keeps both.
        assert_eq!(t.responsible(&[10], FieldId(1))[0].did, DistributedId(1));
        assert_eq!(t.responsible(&[60], FieldId(0))[0].did, DistributedId(1));
        let r = t.compute(&Rect::line(0, 99), &mask(&[0]), &mut f);
        assert_eq!(r.local.len(), 2);
    }

    #[test]
    fn invalidate_then_recompute_creates_new_set() {
        let mut t = EqKDTree::new(Rect::line(0, 9));
        let mut f = Counter(0);
        t.compute(&Rect::line(0, 9), &mask(&[0]), &mut f);
        assert_eq!(t.invalidate(&Rect::line(0, 9), &mask(&[0])), 1);
        assert!(t.lookup(&Rect::line(0, 9), &mask(&[0])).is_none());
        let r = t.compute(&Rect::line(0, 9), &mask(&[0]), &mut f);
        assert_eq!(r.local[0].set.did, DistributedId(2));
    }

    #[test]
    fn remote_subtree_reported() {
        let mut t = EqKDTree::new(Rect::line(0, 99));
        t.set_remote(&Rect::line(50, 99), NodeId(3));
        let mut f = Counter(0);
        let r = t.compute(&Rect::line(40, 60), &mask(&[0]), &mut f);
        assert_eq!(r.local.len(), 1);
        assert_eq!(
            r.remote,
            vec![RemoteSubtree {
                owner: NodeId(3),
                bounds: Rect::line(50, 60),
                mask: mask(&[0]),
            }]
        );
    }

    proptest! {
        #[test]
        fn at_most_one_set_per_point_and_field(
            ops in prop::collection::vec((0i64..64, 0i64..16, 0u32..4, any::<bool>()), 1..24),
        ) {
            let mut t = EqKDTree::new(Rect::line(0, 79));
            let mut f = Counter(0);
            for (lo, len, field, refine) in ops {
                let q = Rect::line(lo, lo + len);
                let m = mask(&[field]);
                if refine {
                    t.refine(&q, &m, &mut f);
                } else {
                    let r = t.compute(&q, &m, &mut f);
                    // Every queried (point, field) is covered exactly once.
                    for p in lo..=(lo + len).min(79) {
                        prop_assert_eq!(t.responsible(&[p], FieldId(field)).len(), 1);
                    }
                    prop_assert!(r.local.iter().all(|o| o.mask == m));
                }
            }
            for p in 0..80 {
                for field in 0..4 {
                    prop_assert!(t.responsible(&[p], FieldId(field)).len() <= 1);
                }
            }
        }
    }
}
