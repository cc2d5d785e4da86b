//! Distributed reference counting.
//!
//! The [`OwnershipLedger`] tracks, per distributed id, a local strong count
//! and the remote nodes holding references. An object is reclaimed exactly
//! once, when both reach zero.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::debug;
use weft_core::{DistributedId, NodeId};

use crate::error::EqSetError;

/// Outcome of dropping a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Other references remain.
    Retained,
    /// That was the last reference; the object may be deleted.
    Reclaimed,
}

#[derive(Debug, Default)]
struct Holders {
    local: u64,
    remote: BTreeMap<NodeId, u64>,
}

impl Holders {
    fn is_dead(&self) -> bool {
        self.local == 0 && self.remote.is_empty()
    }
}

/// Map from distributed id to its local and remote holders.
#[derive(Debug, Default)]
pub struct OwnershipLedger {
    entries: Mutex<HashMap<DistributedId, Holders>>,
}

impl OwnershipLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `did` with one local reference. Re-registering adds one.
    pub fn register(&self, did: DistributedId) {
        self.entries.lock().entry(did).or_default().local += 1;
    }

    /// Add a local reference to a tracked object.
    pub fn add_local(&self, did: DistributedId) -> Result<(), EqSetError> {
        let mut entries = self.entries.lock();
        let h = entries
            .get_mut(&did)
            .ok_or(EqSetError::UnknownObject { did })?;
        h.local += 1;
        Ok(())
    }

    /// Drop a local reference.
    pub fn remove_local(&self, did: DistributedId) -> Result<Release, EqSetError> {
        let mut entries = self.entries.lock();
        let h = entries
            .get_mut(&did)
            .ok_or(EqSetError::UnknownObject { did })?;
        if h.local == 0 {
            return Err(EqSetError::ReleaseUnderflow { did, holder: None });
        }
        h.local -= 1;
        Ok(Self::settle(&mut entries, did))
    }

    /// Record that `node` holds a reference.
    pub fn add_remote(&self, did: DistributedId, node: NodeId) -> Result<(), EqSetError> {
        let mut entries = self.entries.lock();
        let h = entries
            .get_mut(&did)
            .ok_or(EqSetError::UnknownObject { did })?;
        *h.remote.entry(node).or_insert(0) += 1;
        Ok(())
    }

    /// Record that `node` dropped a reference.
    pub fn remove_remote(&self, did: DistributedId, node: NodeId) -> Result<Release, EqSetError> {
        let mut entries = self.entries.lock();
        let h = entries
            .get_mut(&did)
            .ok_or(EqSetError::UnknownObject { did })?;
        let Some(count) = h.remote.get_mut(&node) else {
            return Err(EqSetError::ReleaseUnderflow {
                did,
                holder: Some(node),
            });
        };
        *count -= 1;
        if *count == 0 {
            h.remote.remove(&node);
        }
        Ok(Self::settle(&mut entries, did))
    }

    fn settle(entries: &mut HashMap<DistributedId, Holders>, did: DistributedId) -> Release {
        if entries.get(&did).is_some_and(Holders::is_dead) {
            entries.remove(&did);
            debug!(%did, "distributed object reclaimed");
            Release::Reclaimed
        } else {
            Release::Retained
        }
    }

    /// Whether `did` is still tracked.
    pub fn is_live(&self, did: DistributedId) -> bool {
        self.entries.lock().contains_key(&did)
    }

    /// Local count and remote holders of `did`.
    pub fn holders(&self, did: DistributedId) -> Option<(u64, Vec<NodeId>)> {
        self.entries
            .lock()
            .get(&did)
            .map(|h| (h.local, h.remote.keys().copied().collect()))
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaimed_only_when_local_and_remote_drop() {
        let l = OwnershipLedger::new();
        let did = DistributedId(9);
        l.register(did);
        l.add_remote(did, NodeId(1)).unwrap();
        assert_eq!(l.remove_local(did), Ok(Release::Retained));
        assert!(l.is_live(did));
        assert_eq!(l.holders(did), Some((0, vec![NodeId(1)])));
        assert_eq!(l.remove_remote(did, NodeId(1)), Ok(Release::Reclaimed));
        assert!(!l.is_live(did));
        assert!(l.is_empty());
    }

    #[test]
    fn remote_counts_per_node() {
        let l = OwnershipLedger::new();
        let did = DistributedId(1);
        l.register(did);
        l.add_remote(did, NodeId(2)).unwrap();
        l.add_remote(did, NodeId(2)).unwrap();
        l.remove_local(did).unwrap();
        assert_eq!(l.remove_remote(did, NodeId(2)), Ok(Release::Retained));
        assert_eq!(l.remove_remote(did, NodeId(2)), Ok(Release::Reclaimed));
    }

    #[test]
    fn underflow_and_unknown_rejected() {
        let l = OwnershipLedger::new();
        let did = DistributedId(3);
        assert_eq!(l.add_local(did), Err(EqSetError::UnknownObject { did }));
        l.register(did);
        l.add_remote(did, NodeId(0)).unwrap();
        assert_eq!(
            l.remove_remote(did, NodeId(5)),
            Err(EqSetError::ReleaseUnderflow {
                did,
                holder: Some(NodeId(5))
            })
        );
        l.remove_local(did).unwrap();
        assert_eq!(
            l.remove_local(did),
            Err(EqSetError::ReleaseUnderflow { did, holder: None })
        );
    }
}
