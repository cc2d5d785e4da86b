//! Remote contexts.
//!
//! A remote context is the copy of an inner context made on another node
//! so operations mapped there can name their parent. It answers
//! equivalence-set queries, forwarding to the owner what it does not hold,
//! and mirrors the state the owner pushes: local fields, created regions
//! and collective views. Releasing it drops the owner's remote reference.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};
use weft_core::{
    ContextError, DistributedId, FieldMask, FieldSpaceId, LogicalRegion, NodeId, PhaseBarrier,
    RegionTreeId,
};
use weft_eqset::{EqKDRoot, EquivalenceSet, Rect};
use weft_pipeline::{OpSpec, RegionRequirement};

use crate::context::{OpHandle, PendingSets, TaskContext};
use crate::fields::{LocalFieldInfo, LocalFields};
use crate::message::{Message, SetReport, ViewAction};
use crate::replicate::barrier::BarrierTag;
use crate::resources::Resource;
use crate::runtime::{ContextHandler, IdKind, Runtime};

/// State shipped to a node that needs a copy of a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedContext {
    /// Distributed id of the context.
    pub did: DistributedId,
    /// Node owning the context.
    pub owner: NodeId,
    /// Depth in the task tree.
    pub depth: u32,
    /// Privileges of the task.
    pub requirements: Vec<RegionRequirement>,
    /// Local fields per field space.
    pub local_fields: Vec<(FieldSpaceId, Vec<LocalFieldInfo>)>,
    /// Regions the context created.
    pub created_regions: Vec<LogicalRegion>,
}

/// Copy of a context owned by another node.
pub struct RemoteContext {
    did: DistributedId,
    owner: NodeId,
    depth: u32,
    runtime: Arc<Runtime>,
    requirements: Vec<RegionRequirement>,
    local_fields: Mutex<LocalFields>,
    created_trees: RwLock<HashSet<RegionTreeId>>,
    trees: Mutex<HashMap<u32, Arc<EqKDRoot>>>,
    views: Mutex<HashSet<DistributedId>>,
    released: AtomicBool,
}

/// Install the copy described by `packed` on `runtime`'s node.
pub fn unpack_remote_context(
    runtime: &Arc<Runtime>,
    packed: PackedContext,
) -> Result<Arc<RemoteContext>, ContextError> {
    let mut fields = LocalFields::new();
    for (fs, infos) in &packed.local_fields {
        fields.record_remote(*fs, infos);
    }
    let ctx = Arc::new(RemoteContext {
        did: packed.did,
        owner: packed.owner,
        depth: packed.depth,
        runtime: Arc::clone(runtime),
        requirements: packed.requirements,
        local_fields: Mutex::new(fields),
        created_trees: RwLock::new(packed.created_regions.iter().map(|r| r.tree).collect()),
        trees: Mutex::new(HashMap::new()),
        views: Mutex::new(HashSet::new()),
        released: AtomicBool::new(false),
    });
    let handler: Arc<dyn ContextHandler> = ctx.clone();
    let replayed = runtime.register_context(ctx.did, Arc::downgrade(&handler))?;
    debug!(
        context = %ctx.did,
        owner = %ctx.owner,
        node = %runtime.node(),
        replayed,
        "remote context unpacked"
    );
    Ok(ctx)
}

impl RemoteContext {
    /// Distributed id of the context.
    pub fn did(&self) -> DistributedId {
        self.did
    }

    /// Node owning the context.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Depth of the context in the task tree.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Privileges of the task.
    pub fn requirements(&self) -> &[RegionRequirement] {
        &self.requirements
    }

    /// Local fields known for `fs`.
    pub fn local_fields(&self, fs: FieldSpaceId) -> Vec<LocalFieldInfo> {
        self.local_fields.lock().fields(fs)
    }

    /// Whether the owner reported creating a region of `tree`.
    pub fn has_created_tree(&self, tree: RegionTreeId) -> bool {
        self.created_trees.read().contains(&tree)
    }

    /// Whether this node holds collective view `view`.
    pub fn has_collective_view(&self, view: DistributedId) -> bool {
        self.views.lock().contains(&view)
    }

    /// Drop the copy and the owner's remote reference. Idempotent.
    pub fn release(&self) -> Result<(), ContextError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.runtime.unregister_context(self.did);
        debug!(context = %self.did, owner = %self.owner, "remote context released");
        self.runtime
            .send(self.owner, Message::RemoteRelease { context: self.did })
    }

    fn local_tree(&self, requirement: u32, bounds: &Rect) -> Arc<EqKDRoot> {
        let root_bounds = self
            .requirements
            .get(requirement as usize)
            .and_then(|r| self.runtime.forest().index_space_bounds(r.region.index_space))
            .unwrap_or_else(|| bounds.clone());
        Arc::clone(
            self.trees
                .lock()
                .entry(requirement)
                .or_insert_with(|| Arc::new(EqKDRoot::new(root_bounds))),
        )
    }

    fn answer(&self, request: u64, requirement: u32, bounds: &Rect, mask: &FieldMask, to: NodeId) {
        let tree = self.local_tree(requirement, bounds);
        let runtime = Arc::clone(&self.runtime);
        let mut factory = move |b: &Rect| {
            let did = DistributedId(runtime.allocate(IdKind::EquivalenceSet));
            Arc::new(EquivalenceSet::new(did, runtime.node(), b.clone()))
        };
        let lookup = tree.compute(bounds, mask, &mut factory);
        let sets = lookup
            .local
            .into_iter()
            .map(|o| SetReport {
                did: o.set.did,
                owner: o.set.owner,
                bounds: o.set.bounds.clone(),
                mask: o.mask,
            })
            .collect();
        if let Err(e) = self.runtime.send(to, Message::EqSetResponse { request, sets }) {
            error!(context = %self.did, request, error = %e, "equivalence-set reply lost");
        }
    }
}

impl TaskContext for RemoteContext {
    fn issue_operation(&self, spec: OpSpec) -> Result<OpHandle, ContextError> {
        Err(ContextError::IllegalCall {
            call: spec.kind.name(),
            reason: "operations are issued on the owning node".into(),
        })
    }

    fn track_resource(&self, resource: Resource) -> Result<(), ContextError> {
        Err(ContextError::IllegalCall {
            call: "track_resource",
            reason: format!("{resource} must be created on the owning node"),
        })
    }

    /// Forwarded to the owner; the sets arrive in its reply.
    fn find_equivalence_sets(
        &self,
        requirement: u32,
        bounds: &Rect,
        mask: &FieldMask,
    ) -> Result<PendingSets, ContextError> {
        if self.released.load(Ordering::Acquire) {
            return Err(ContextError::ContextEnded);
        }
        let (request, ready) = self.runtime.reports().open([self.owner]);
        trace!(context = %self.did, request, owner = %self.owner, "query forwarded");
        self.runtime.send(
            self.owner,
            Message::EqSetRequest {
                context: self.did,
                request,
                requirement,
                bounds: bounds.clone(),
                mask: mask.clone(),
                reply_to: self.runtime.node(),
            },
        )?;
        Ok(PendingSets::new(
            Vec::new(),
            Some(request),
            ready,
            Arc::clone(&self.runtime),
        ))
    }

    fn barrier_for(&self, _tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError> {
        Ok(None)
    }
}

impl ContextHandler for RemoteContext {
    fn handle_message(&self, from: NodeId, msg: Message) {
        match msg {
            Message::EqSetRequest {
                request,
                requirement,
                bounds,
                mask,
                reply_to,
                ..
            } => self.answer(request, requirement, &bounds, &mask, reply_to),
            Message::CollectiveView {
                action: ViewAction::Create,
                view,
                ..
            } => {
                self.views.lock().insert(view);
                trace!(context = %self.did, %view, "collective view held");
            }
            Message::CollectiveView {
                action: ViewAction::Delete,
                view,
                ..
            } => {
                let held = self.views.lock().remove(&view);
                if !held {
                    warn!(context = %self.did, %view, "delete for a view not held");
                    return;
                }
                let reply = Message::CollectiveView {
                    context: self.did,
                    action: ViewAction::Release,
                    view,
                };
                if let Err(e) = self.runtime.send(from, reply) {
                    error!(context = %self.did, %view, error = %e, "view release lost");
                }
            }
            Message::LocalFieldUpdate {
                field_space,
                fields,
                ..
            } => {
                self.local_fields.lock().record_remote(field_space, &fields);
            }
            Message::CreatedRegions { regions, .. } => {
                self.created_trees
                    .write()
                    .extend(regions.iter().map(|r| r.tree));
            }
            other => warn!(
                context = %self.did,
                kind = %other.kind(),
                %from,
                "message not handled by a remote context"
            ),
        }
    }
}

impl fmt::Debug for RemoteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteContext")
            .field("did", &self.did)
            .field("owner", &self.owner)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<RemoteContext>();
    assert::<PackedContext>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use weft_pipeline::{ManualScheduler, OpKind};

    use crate::config::ContextConfig;
    use crate::inner::InnerContext;
    use crate::regions::ResourceOwner;
    use crate::runtime::Cluster;

    fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn pair() -> (Cluster, Arc<InnerContext>, Arc<RemoteContext>) {
        let cluster = Cluster::new(
            2,
            ContextConfig::default(),
            Arc::new(ManualScheduler::new()),
        )
        .unwrap();
        let owner = InnerContext::root(Arc::clone(cluster.node(0).unwrap())).unwrap();
        let packed = owner.pack_remote_context(NodeId(1)).unwrap();
        let remote = unpack_remote_context(cluster.node(1).unwrap(), packed).unwrap();
        (cluster, owner, remote)
    }

    #[test]
    fn remote_rejects_issue_and_creation() {
        let (cluster, _owner, remote) = pair();
        assert!(matches!(
            remote.issue_operation(OpSpec::new(OpKind::Copy)),
            Err(ContextError::IllegalCall { call: "copy", .. })
        ));
        assert!(remote
            .track_resource(Resource::FieldSpace(FieldSpaceId(1)))
            .is_err());
        cluster.shutdown();
    }

    #[test]
    fn query_is_answered_by_the_owner() {
        let (cluster, owner, remote) = pair();
        let sets = remote
            .find_equivalence_sets(0, &Rect::line(0, 9), &FieldMask::first_n(2))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].set.owner, NodeId(0));
        // The owner now holds the same set locally.
        let local = owner
            .find_equivalence_sets(0, &Rect::line(0, 9), &FieldMask::first_n(2))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(local[0].set.did, sets[0].set.did);
        cluster.shutdown();
    }

    #[test]
    fn owner_forwards_subtrees_owned_remotely() {
        let (cluster, owner, _remote) = pair();
        let mask = FieldMask::first_n(1);
        owner.refine_equivalence_sets(0, &Rect::line(0, 99), &mask).unwrap();
        owner.set_remote_owner(0, &Rect::line(50, 99), NodeId(1));
        let sets = owner
            .find_equivalence_sets(0, &Rect::line(0, 99), &mask)
            .unwrap()
            .wait()
            .unwrap();
        let owners: HashSet<NodeId> = sets.iter().map(|o| o.set.owner).collect();
        assert!(owners.contains(&NodeId(0)));
        assert!(owners.contains(&NodeId(1)));
        cluster.shutdown();
    }

    #[test]
    fn owner_pushes_fields_and_regions() {
        let (cluster, owner, remote) = pair();
        let fs = owner.create_field_space().unwrap();
        owner.allocate_field(fs, 16).unwrap();
        let is = owner.create_index_space(Rect::line(0, 7)).unwrap();
        let region = owner.create_logical_region(is, fs).unwrap();
        assert!(eventually(|| remote.local_fields(fs).len() == 1));
        assert!(eventually(|| remote.has_created_tree(region.tree)));
        cluster.shutdown();
    }

    #[test]
    fn release_drops_the_remote_reference() {
        let (cluster, owner, remote) = pair();
        assert_eq!(owner.remote_holders(), vec![NodeId(1)]);
        remote.release().unwrap();
        remote.release().unwrap();
        assert!(eventually(|| owner.remote_holders().is_empty()));
        cluster.shutdown();
    }

    #[test]
    fn collective_view_is_reclaimed_after_holders_release() {
        let (cluster, owner, remote) = pair();
        let view = owner.create_collective_view(&[NodeId(1)]).unwrap();
        assert!(eventually(|| remote.has_collective_view(view)));
        assert!(!owner.delete_collective_view(view).unwrap());
        assert!(eventually(|| !owner.has_collective_view(view)));
        assert!(!remote.has_collective_view(view));
        cluster.shutdown();
    }
}
