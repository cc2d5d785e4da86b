//! Fill-view cache.
//!
//! Fills with the same value share a view. The cache maps fill value bytes
//! to the view's distributed id and evicts the least recently used view
//! once full.

use indexmap::IndexMap;
use tracing::trace;
use weft_core::DistributedId;

/// Outcome of a cache lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillView {
    /// View id.
    pub view: DistributedId,
    /// Whether the view was already cached.
    pub hit: bool,
}

/// LRU cache of fill views keyed by fill value.
#[derive(Debug)]
pub struct FillViewCache {
    capacity: usize,
    // Least recently used first.
    views: IndexMap<Vec<u8>, DistributedId>,
}

impl FillViewCache {
    /// Cache holding at most `capacity` views (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            views: IndexMap::new(),
        }
    }

    /// View for `value`, creating one with `create` on a miss.
    pub fn find_or_create<F>(&mut self, value: &[u8], create: F) -> FillView
    where
        F: FnOnce() -> DistributedId,
    {
        if let Some(i) = self.views.get_index_of(value) {
            let last = self.views.len() - 1;
            self.views.move_index(i, last);
            let view = self.views[last];
            return FillView { view, hit: true };
        }
        if self.views.len() == self.capacity {
            if let Some((_, evicted)) = self.views.shift_remove_index(0) {
                trace!(view = %evicted, "fill view evicted");
            }
        }
        let view = create();
        self.views.insert(value.to_vec(), view);
        FillView { view, hit: false }
    }

    /// Number of cached views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Whether `value` has a cached view. Does not touch recency.
    pub fn contains(&self, value: &[u8]) -> bool {
        self.views.contains_key(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_reuses_view() {
        let mut c = FillViewCache::new(4);
        let a = c.find_or_create(&[1], || DistributedId(10));
        let b = c.find_or_create(&[1], || DistributedId(11));
        assert!(!a.hit);
        assert!(b.hit);
        assert_eq!(b.view, DistributedId(10));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut c = FillViewCache::new(2);
        c.find_or_create(&[1], || DistributedId(1));
        c.find_or_create(&[2], || DistributedId(2));
        // Touch [1] so [2] becomes the oldest.
        c.find_or_create(&[1], || DistributedId(99));
        c.find_or_create(&[3], || DistributedId(3));
        assert_eq!(c.len(), 2);
        assert!(c.contains(&[1]));
        assert!(!c.contains(&[2]));
        assert!(c.contains(&[3]));
    }

    #[test]
    fn default_capacity_holds_64_views() {
        let mut c = FillViewCache::new(64);
        for v in 0..100u8 {
            c.find_or_create(&[v], || DistributedId(u64::from(v)));
        }
        assert_eq!(c.len(), 64);
        assert!(c.contains(&[99]));
        assert!(!c.contains(&[35]));
        assert!(c.contains(&[36]));
    }
}
