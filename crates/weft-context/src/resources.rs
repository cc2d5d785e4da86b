//! Resource tracking and return.
//!
//! A context records every region-tree resource it creates together with a
//! use count. [`ResourceTracker::create_shared_ownership`] raises the count;
//! each deletion lowers it and contributes its precondition event. The last
//! deletion schedules the destroy action once every collected precondition
//! has triggered, so N shared deletions destroy exactly once.
//!
//! Deletions of resources the context does not own are kept and handed to
//! the parent, together with every still-live creation, by
//! [`ResourceTracker::return_resources`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};
use weft_core::{
    ContextError, Event, FieldId, FieldMask, FieldSpaceId, IndexPartitionId, IndexSpaceId,
    LogicalRegion, ResourceError, ResourceKind,
};

use crate::config::LeakPolicy;

// ── Resource ───────────────────────────────────────────────────────

/// A region-tree resource owned by some context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A logical region (its whole tree).
    Region(LogicalRegion),
    /// A field of a field space.
    Field(FieldSpaceId, FieldId),
    /// A field space.
    FieldSpace(FieldSpaceId),
    /// An index space.
    IndexSpace(IndexSpaceId),
    /// An index partition.
    IndexPartition(IndexPartitionId),
}

impl Resource {
    /// Kind of the resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Region(_) => ResourceKind::Region,
            Self::Field(..) => ResourceKind::Field,
            Self::FieldSpace(_) => ResourceKind::FieldSpace,
            Self::IndexSpace(_) => ResourceKind::IndexSpace,
            Self::IndexPartition(_) => ResourceKind::IndexPartition,
        }
    }

    /// Raw identifier used in error reports.
    ///
    /// Regions report their tree id; fields pack the field space into the
    /// high 32 bits.
    pub fn raw(&self) -> u64 {
        match self {
            Self::Region(r) => r.tree.0,
            Self::Field(fs, fid) => (fs.0 << 32) | u64::from(fid.0),
            Self::FieldSpace(fs) => fs.0,
            Self::IndexSpace(is) => is.0,
            Self::IndexPartition(ip) => ip.0,
        }
    }

    /// Whether an access to `fields` of `region` uses this resource.
    pub fn touches(&self, region: &LogicalRegion, fields: &FieldMask) -> bool {
        match self {
            Self::Region(r) => region.tree == r.tree,
            Self::Field(fs, fid) => region.field_space == *fs && fields.contains(*fid),
            Self::FieldSpace(fs) => region.field_space == *fs,
            Self::IndexSpace(is) => region.index_space == *is,
            Self::IndexPartition(_) => false,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Region(r) => write!(f, "region {r}"),
            Self::Field(fs, fid) => write!(f, "field {fid} of field space {fs}"),
            Self::FieldSpace(fs) => write!(f, "field space {fs}"),
            Self::IndexSpace(is) => write!(f, "index space {is}"),
            Self::IndexPartition(ip) => write!(f, "index partition {ip}"),
        }
    }
}

/// Destroy action invoked exactly once per resource.
pub type DestroyFn = Arc<dyn Fn(&Resource) + Send + Sync>;

// ── Returned resources ─────────────────────────────────────────────

/// A live creation handed to the parent.
#[derive(Clone, Debug)]
pub struct CreatedRecord {
    /// The resource.
    pub resource: Resource,
    /// Deletions still needed before it is destroyed.
    pub uses: u32,
    /// Preconditions of deletions already performed.
    pub preconditions: Vec<Event>,
}

/// Everything a context hands to its parent when its task ends.
#[derive(Clone, Debug, Default)]
pub struct ReturnedResources {
    /// Live creations, in creation order.
    pub created: Vec<CreatedRecord>,
    /// Deletions of resources the context did not own, with preconditions.
    pub deletions: Vec<(Resource, Event)>,
}

impl ReturnedResources {
    /// Whether there is nothing to hand over.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deletions.is_empty()
    }
}

/// What a deletion did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Other uses remain.
    Deferred {
        /// Deletions still needed.
        remaining: u32,
    },
    /// Last use: the destroy action runs once the event triggers.
    Destroying(Event),
    /// Not owned here; kept for the parent.
    Returned,
    /// The resource was already destroyed.
    Duplicate,
}

// ── ResourceTracker ────────────────────────────────────────────────

#[derive(Debug)]
struct Created {
    uses: u32,
    preconditions: Vec<Event>,
}

/// Creations and deletions owned by one context.
#[derive(Default)]
pub struct ResourceTracker {
    created: IndexMap<Resource, Created>,
    returnable: Vec<(Resource, Event)>,
    destroyed: HashSet<Resource>,
    duplicates: Vec<Resource>,
}

impl ResourceTracker {
    /// Nothing tracked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource created by this context with one use.
    ///
    /// Returns `false` if it was already tracked.
    pub fn register_creation(&mut self, resource: Resource) -> bool {
        if self.created.contains_key(&resource) {
            return false;
        }
        self.destroyed.remove(&resource);
        self.created.insert(
            resource,
            Created {
                uses: 1,
                preconditions: Vec::new(),
            },
        );
        true
    }

    /// Add a use to a created resource. Returns the new use count.
    pub fn create_shared_ownership(&mut self, resource: Resource) -> Result<u32, ContextError> {
        match self.created.get_mut(&resource) {
            Some(c) => {
                c.uses += 1;
                Ok(c.uses)
            }
            None if self.destroyed.contains(&resource) => {
                Err(ContextError::Resource(ResourceError::DuplicateDeletion {
                    kind: resource.kind(),
                    id: resource.raw(),
                }))
            }
            None => Err(ContextError::UnknownResource {
                kind: resource.kind(),
                id: resource.raw(),
            }),
        }
    }

    /// Delete a resource once `precondition` triggers.
    pub fn register_deletion(
        &mut self,
        resource: Resource,
        precondition: Event,
        destroy: &DestroyFn,
    ) -> DeletionOutcome {
        if let Some(c) = self.created.get_mut(&resource) {
            c.uses -= 1;
            c.preconditions.push(precondition);
            if c.uses > 0 {
                debug!(%resource, remaining = c.uses, "deletion deferred");
                return DeletionOutcome::Deferred { remaining: c.uses };
            }
            let preconditions = match self.created.shift_remove(&resource) {
                Some(c) => c.preconditions,
                None => Vec::new(),
            };
            self.destroyed.insert(resource);
            let ready = Event::all_settled(preconditions);
            let destroy = Arc::clone(destroy);
            debug!(%resource, "destroy scheduled");
            ready.subscribe(move |_| destroy(&resource));
            return DeletionOutcome::Destroying(ready);
        }
        if self.destroyed.contains(&resource) {
            self.duplicates.push(resource);
            return DeletionOutcome::Duplicate;
        }
        self.returnable.push((resource, precondition));
        DeletionOutcome::Returned
    }

    /// Hand every live creation and every returnable deletion to the
    /// caller, leaving the tracker empty of both.
    pub fn return_resources(&mut self) -> ReturnedResources {
        let created = self
            .created
            .drain(..)
            .map(|(resource, c)| CreatedRecord {
                resource,
                uses: c.uses,
                preconditions: c.preconditions,
            })
            .collect();
        ReturnedResources {
            created,
            deletions: std::mem::take(&mut self.returnable),
        }
    }

    /// Take ownership of resources returned by a child.
    ///
    /// Creations become owned here; deletions are applied as if issued
    /// here, which may destroy or pass them further up.
    pub fn receive_returned(
        &mut self,
        returned: ReturnedResources,
        destroy: &DestroyFn,
    ) -> Vec<DeletionOutcome> {
        for record in returned.created {
            match self.created.get_mut(&record.resource) {
                Some(c) => {
                    c.uses += record.uses;
                    c.preconditions.extend(record.preconditions);
                }
                None => {
                    self.destroyed.remove(&record.resource);
                    self.created.insert(
                        record.resource,
                        Created {
                            uses: record.uses,
                            preconditions: record.preconditions,
                        },
                    );
                }
            }
        }
        returned
            .deletions
            .into_iter()
            .map(|(resource, pre)| self.register_deletion(resource, pre, destroy))
            .collect()
    }

    /// Destroy every live creation once `after` and its collected
    /// preconditions trigger. Used by a context with no parent.
    pub fn destroy_all(&mut self, after: Event, destroy: &DestroyFn) -> usize {
        let records = self.return_resources();
        let n = records.created.len();
        for record in records.created {
            let resource = record.resource;
            self.destroyed.insert(resource);
            let destroy = Arc::clone(destroy);
            let mut preconditions = record.preconditions;
            preconditions.push(after.clone());
            Event::all_settled(preconditions).subscribe(move |_| destroy(&resource));
        }
        for (resource, _) in records.deletions {
            self.duplicates.push(resource);
        }
        n
    }

    /// Report duplicate deletions and resources still live.
    ///
    /// Under [`LeakPolicy::Warn`] problems are logged and `Ok` is returned;
    /// under [`LeakPolicy::Fatal`] the first problem is returned.
    pub fn report_leaks_and_duplicates(&mut self, policy: LeakPolicy) -> Result<(), ResourceError> {
        let mut problems = Vec::new();
        for resource in self.duplicates.drain(..) {
            problems.push(ResourceError::DuplicateDeletion {
                kind: resource.kind(),
                id: resource.raw(),
            });
        }
        let mut leaked: IndexMap<ResourceKind, Vec<u64>> = IndexMap::new();
        for resource in self.created.keys() {
            leaked.entry(resource.kind()).or_default().push(resource.raw());
        }
        for (kind, ids) in leaked {
            problems.push(ResourceError::Leaked { kind, ids });
        }
        match policy {
            LeakPolicy::Warn => {
                for p in &problems {
                    warn!(problem = %p, "resource accounting");
                }
                Ok(())
            }
            LeakPolicy::Fatal => match problems.into_iter().next() {
                Some(p) => Err(p),
                None => Ok(()),
            },
        }
    }

    /// Use count of a created resource.
    pub fn uses(&self, resource: &Resource) -> Option<u32> {
        self.created.get(resource).map(|c| c.uses)
    }

    /// Whether the resource is live and owned here.
    pub fn owns(&self, resource: &Resource) -> bool {
        self.created.contains_key(resource)
    }

    /// Live regions owned here, in creation order.
    pub fn regions(&self) -> Vec<LogicalRegion> {
        self.created
            .keys()
            .filter_map(|r| match r {
                Resource::Region(region) => Some(*region),
                _ => None,
            })
            .collect()
    }

    /// Number of live creations.
    pub fn created_len(&self) -> usize {
        self.created.len()
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("created", &self.created.len())
            .field("returnable", &self.returnable.len())
            .field("destroyed", &self.destroyed.len())
            .field("duplicates", &self.duplicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use weft_core::UserEvent;

    fn recorder() -> (DestroyFn, Arc<Mutex<Vec<Resource>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let f: DestroyFn = Arc::new(move |r: &Resource| l.lock().push(*r));
        (f, log)
    }

    const FS: Resource = Resource::FieldSpace(FieldSpaceId(7));

    #[test]
    fn single_deletion_destroys_after_precondition() {
        let (destroy, log) = recorder();
        let mut t = ResourceTracker::new();
        t.register_creation(FS);
        let pre = UserEvent::new();
        let out = t.register_deletion(FS, pre.event(), &destroy);
        assert!(matches!(out, DeletionOutcome::Destroying(_)));
        assert!(log.lock().is_empty());
        pre.trigger();
        assert_eq!(*log.lock(), vec![FS]);
    }

    #[test]
    fn second_deletion_is_duplicate() {
        let (destroy, _) = recorder();
        let mut t = ResourceTracker::new();
        t.register_creation(FS);
        t.register_deletion(FS, Event::NO_EVENT, &destroy);
        assert_eq!(
            t.register_deletion(FS, Event::NO_EVENT, &destroy),
            DeletionOutcome::Duplicate
        );
        assert_eq!(
            t.report_leaks_and_duplicates(LeakPolicy::Fatal),
            Err(ResourceError::DuplicateDeletion {
                kind: ResourceKind::FieldSpace,
                id: 7
            })
        );
    }

    #[test]
    fn foreign_deletions_are_returned() {
        let (destroy, log) = recorder();
        let mut child = ResourceTracker::new();
        assert_eq!(
            child.register_deletion(FS, Event::NO_EVENT, &destroy),
            DeletionOutcome::Returned
        );
        let ret = child.return_resources();
        assert_eq!(ret.deletions.len(), 1);
        let mut parent = ResourceTracker::new();
        parent.register_creation(FS);
        parent.receive_returned(ret, &destroy);
        assert_eq!(*log.lock(), vec![FS]);
    }

    #[test]
    fn leaks_reported_by_kind() {
        let mut t = ResourceTracker::new();
        t.register_creation(Resource::IndexSpace(IndexSpaceId(1)));
        t.register_creation(Resource::IndexSpace(IndexSpaceId(2)));
        assert_eq!(t.report_leaks_and_duplicates(LeakPolicy::Warn), Ok(()));
        assert_eq!(
            t.report_leaks_and_duplicates(LeakPolicy::Fatal),
            Err(ResourceError::Leaked {
                kind: ResourceKind::IndexSpace,
                ids: vec![1, 2]
            })
        );
    }

    #[test]
    fn destroy_all_waits_for_partial_deletions() {
        let (destroy, log) = recorder();
        let mut t = ResourceTracker::new();
        t.register_creation(FS);
        t.create_shared_ownership(FS).unwrap();
        let pre = UserEvent::new();
        t.register_deletion(FS, pre.event(), &destroy);
        assert_eq!(t.destroy_all(Event::NO_EVENT, &destroy), 1);
        assert!(log.lock().is_empty());
        pre.trigger();
        assert_eq!(*log.lock(), vec![FS]);
    }

    #[test]
    fn sharing_unknown_resource_rejected() {
        let mut t = ResourceTracker::new();
        assert!(t.create_shared_ownership(FS).is_err());
    }

    proptest! {
        // N shared deletions destroy exactly once, after the last
        // precondition.
        #[test]
        fn shared_deletions_destroy_once(
            n in 1usize..12,
            order in proptest::collection::vec(any::<u8>(), 12),
        ) {
            let (destroy, log) = recorder();
            let mut t = ResourceTracker::new();
            t.register_creation(FS);
            for _ in 1..n {
                t.create_shared_ownership(FS).unwrap();
            }
            let pres: Vec<UserEvent> = (0..n).map(|_| UserEvent::new()).collect();
            for p in &pres {
                t.register_deletion(FS, p.event(), &destroy);
            }
            let mut idx: Vec<usize> = (0..n).collect();
            idx.sort_by_key(|i| order[*i]);
            for (k, i) in idx.iter().enumerate() {
                prop_assert_eq!(log.lock().len(), 0, "destroyed before deletion {}", k);
                pres[*i].trigger();
            }
            prop_assert_eq!(log.lock().clone(), vec![FS]);
        }

        // Returning hands over exactly one record per live creation.
        #[test]
        fn return_transfers_one_record_per_creation(
            ids in proptest::collection::btree_set(1u64..500, 0..40),
        ) {
            let mut t = ResourceTracker::new();
            for id in &ids {
                t.register_creation(Resource::IndexSpace(IndexSpaceId(*id)));
            }
            let ret = t.return_resources();
            prop_assert_eq!(ret.created.len(), ids.len());
            let returned: Vec<u64> = ret.created.iter().map(|r| r.resource.raw()).collect();
            prop_assert_eq!(returned, ids.iter().copied().collect::<Vec<_>>());
            prop_assert_eq!(t.created_len(), 0);
        }
    }
}
