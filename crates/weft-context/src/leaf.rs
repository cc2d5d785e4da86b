//! Leaf contexts.
//!
//! A leaf task launches nothing. It may still create and delete
//! region-tree resources; those are handed to the parent when the task
//! ends. Every call that would issue an operation is rejected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};
use weft_core::{ContextError, Event, FieldMask, PhaseBarrier, Point};
use weft_eqset::Rect;
use weft_pipeline::{OpSpec, RegionRequirement};

use crate::config::LeakPolicy;
use crate::context::{NoReplication, OpHandle, PendingSets, ReplicationStrategy, TaskContext};
use crate::inner::InnerContext;
use crate::regions::{primary_destroy, ResourceOwner};
use crate::replicate::barrier::BarrierTag;
use crate::resources::{DeletionOutcome, DestroyFn, Resource, ResourceTracker};
use crate::runtime::Runtime;

/// Context of a leaf task.
pub struct LeafContext {
    parent: Weak<InnerContext>,
    runtime: Arc<Runtime>,
    strategy: Arc<dyn ReplicationStrategy>,
    depth: u32,
    args: Vec<u8>,
    point: Option<Point>,
    requirements: Vec<RegionRequirement>,
    resources: Mutex<ResourceTracker>,
    destroy: DestroyFn,
    leak_policy: LeakPolicy,
    ended: AtomicBool,
}

impl LeafContext {
    /// Leaf child of `parent`.
    pub fn new(
        parent: &Arc<InnerContext>,
        requirements: Vec<RegionRequirement>,
        args: Vec<u8>,
        point: Option<Point>,
    ) -> Arc<Self> {
        let runtime = Arc::clone(parent.runtime());
        let strategy: Arc<dyn ReplicationStrategy> = Arc::new(NoReplication);
        let destroy = primary_destroy(&runtime, &strategy);
        Arc::new(Self {
            parent: Arc::downgrade(parent),
            leak_policy: parent.config().leak_policy,
            depth: parent.depth() + 1,
            runtime,
            strategy,
            args,
            point,
            requirements,
            resources: Mutex::new(ResourceTracker::new()),
            destroy,
            ended: AtomicBool::new(false),
        })
    }

    /// Task arguments.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Launch point, for points of an index launch.
    pub fn point(&self) -> Option<&Point> {
        self.point.as_ref()
    }

    /// Depth in the task tree.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Privileges the task holds.
    pub fn requirements(&self) -> &[RegionRequirement] {
        &self.requirements
    }

    /// Whether the leaf tracks `resource` as live.
    pub fn owns(&self, resource: &Resource) -> bool {
        self.resources.lock().owns(resource)
    }

    /// Hand created resources and pending deletions to the parent.
    pub fn end_task(&self) -> Result<Event, ContextError> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Err(ContextError::ContextEnded);
        }
        let returned = self.resources.lock().return_resources();
        match self.parent.upgrade() {
            Some(parent) => {
                trace!(
                    created = returned.created.len(),
                    deletions = returned.deletions.len(),
                    "leaf resources returned"
                );
                parent.receive_returned(returned)?;
            }
            None => {
                debug!(depth = self.depth, "parent gone; leaf resources destroyed");
                let mut tracker = ResourceTracker::new();
                tracker.receive_returned(returned, &self.destroy);
                tracker.destroy_all(Event::NO_EVENT, &self.destroy);
            }
        }
        self.resources
            .lock()
            .report_leaks_and_duplicates(self.leak_policy)?;
        Ok(Event::NO_EVENT)
    }
}

impl TaskContext for LeafContext {
    fn issue_operation(&self, spec: OpSpec) -> Result<OpHandle, ContextError> {
        Err(ContextError::LeafOperation {
            call: spec.kind.name(),
        })
    }

    fn track_resource(&self, resource: Resource) -> Result<(), ContextError> {
        if self.ended.load(Ordering::Acquire) {
            return Err(ContextError::ContextEnded);
        }
        self.resources.lock().register_creation(resource);
        Ok(())
    }

    fn find_equivalence_sets(
        &self,
        _requirement: u32,
        _bounds: &Rect,
        _mask: &FieldMask,
    ) -> Result<PendingSets, ContextError> {
        Err(ContextError::LeafOperation {
            call: "find_equivalence_sets",
        })
    }

    fn barrier_for(&self, _tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError> {
        Ok(None)
    }
}

impl ResourceOwner for LeafContext {
    fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn strategy(&self) -> &Arc<dyn ReplicationStrategy> {
        &self.strategy
    }

    fn delete_resource(&self, resource: Resource) -> Result<DeletionOutcome, ContextError> {
        if self.ended.load(Ordering::Acquire) {
            return Err(ContextError::ContextEnded);
        }
        // Nothing runs under a leaf; the deletion needs no precondition.
        Ok(self
            .resources
            .lock()
            .register_deletion(resource, Event::NO_EVENT, &self.destroy))
    }

    fn share_resource(&self, resource: Resource) -> Result<u32, ContextError> {
        self.resources.lock().create_shared_ownership(resource)
    }
}

impl std::fmt::Debug for LeafContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafContext")
            .field("depth", &self.depth)
            .field("point", &self.point)
            .field("ended", &self.ended.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::NodeId;
    use weft_pipeline::{ManualScheduler, OpKind};

    use crate::config::ContextConfig;

    fn parent() -> Arc<InnerContext> {
        let rt = Runtime::new(
            NodeId(0),
            ContextConfig::default(),
            Arc::new(ManualScheduler::new()),
        )
        .unwrap();
        InnerContext::root(rt).unwrap()
    }

    #[test]
    fn issuing_from_a_leaf_is_rejected() {
        let p = parent();
        let leaf = LeafContext::new(&p, Vec::new(), Vec::new(), None);
        let err = leaf.issue_operation(OpSpec::new(OpKind::Fill)).unwrap_err();
        assert_eq!(err, ContextError::LeafOperation { call: "fill" });
        assert!(leaf
            .find_equivalence_sets(0, &Rect::line(0, 1), &FieldMask::first_n(1))
            .is_err());
        assert_eq!(leaf.barrier_for(BarrierTag::MappingFence), Ok(None));
    }

    #[test]
    fn created_resources_move_to_parent() {
        let p = parent();
        let leaf = LeafContext::new(&p, Vec::new(), vec![1, 2], None);
        let fs = leaf.create_field_space().unwrap();
        assert!(leaf.owns(&Resource::FieldSpace(fs)));
        leaf.end_task().unwrap();
        assert!(p.owns(&Resource::FieldSpace(fs)));
        assert!(!leaf.owns(&Resource::FieldSpace(fs)));
    }

    #[test]
    fn leaf_ends_once() {
        let p = parent();
        let leaf = LeafContext::new(&p, Vec::new(), Vec::new(), None);
        leaf.end_task().unwrap();
        assert_eq!(leaf.end_task().unwrap_err(), ContextError::ContextEnded);
        assert_eq!(
            leaf.create_field_space().unwrap_err(),
            ContextError::ContextEnded
        );
    }

    #[test]
    fn depth_follows_parent() {
        let p = parent();
        let leaf = LeafContext::new(&p, Vec::new(), Vec::new(), Some(Point::from_slice(&[3])));
        assert_eq!(leaf.depth(), 1);
        assert_eq!(leaf.point().map(|p| p[0]), Some(3));
    }
}
