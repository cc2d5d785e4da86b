//! Region-tree resource calls shared by inner and leaf contexts.
//!
//! Creation allocates identifiers through the context's replication
//! strategy, creates the resource in the region forest and records it with
//! the context. Every shard of a replicated task makes the same forest
//! calls with the same identifiers; forest creation is idempotent, and only
//! destruction is restricted to the primary shard.

use std::sync::Arc;

use tracing::debug;
use weft_core::{
    ContextError, FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, LogicalRegion,
    RegionTreeId, ResourceKind,
};
use weft_eqset::Rect;

use crate::context::{ReplicationStrategy, TaskContext};
use crate::forest::equal_split;
use crate::resources::{DeletionOutcome, DestroyFn, Resource};
use crate::runtime::{IdKind, Runtime};

/// Destroy action that runs on the primary shard only.
pub(crate) fn primary_destroy(
    runtime: &Arc<Runtime>,
    strategy: &Arc<dyn ReplicationStrategy>,
) -> DestroyFn {
    let forest = Arc::clone(runtime.forest());
    let primary = strategy.is_primary();
    Arc::new(move |resource: &Resource| {
        if primary {
            debug!(%resource, "destroying");
            forest.destroy(resource);
        }
    })
}

/// Contexts that create and delete region-tree resources.
pub trait ResourceOwner: TaskContext {
    /// Node runtime.
    fn runtime(&self) -> &Arc<Runtime>;

    /// Replication strategy.
    fn strategy(&self) -> &Arc<dyn ReplicationStrategy>;

    /// Delete `resource` once its users are done.
    fn delete_resource(&self, resource: Resource) -> Result<DeletionOutcome, ContextError>;

    /// Add a use to a resource this context created.
    fn share_resource(&self, resource: Resource) -> Result<u32, ContextError>;

    /// Called after a field was allocated.
    fn on_field_allocated(&self, _fs: FieldSpaceId, _fid: FieldId, _size: u32) {}

    /// Create an index space over `bounds`.
    fn create_index_space(&self, bounds: Rect) -> Result<IndexSpaceId, ContextError> {
        self.strategy().record_call("create_index_space");
        let id = IndexSpaceId(self.strategy().allocate(self.runtime(), IdKind::IndexSpace)?);
        self.runtime().forest().create_index_space(id, bounds);
        self.track_resource(Resource::IndexSpace(id))?;
        Ok(id)
    }

    /// Create an empty field space.
    fn create_field_space(&self) -> Result<FieldSpaceId, ContextError> {
        self.strategy().record_call("create_field_space");
        let id = FieldSpaceId(self.strategy().allocate(self.runtime(), IdKind::FieldSpace)?);
        self.runtime().forest().create_field_space(id);
        self.track_resource(Resource::FieldSpace(id))?;
        Ok(id)
    }

    /// Allocate a field of `size` bytes in `fs`.
    fn allocate_field(&self, fs: FieldSpaceId, size: u32) -> Result<FieldId, ContextError> {
        self.strategy().record_call("allocate_field");
        let raw = self.strategy().allocate(self.runtime(), IdKind::Field)?;
        let fid = FieldId(u32::try_from(raw).map_err(|_| ContextError::IllegalCall {
            call: "allocate_field",
            reason: format!("field id space exhausted at {raw}"),
        })?);
        self.runtime().forest().allocate_field(fs, fid, size);
        self.track_resource(Resource::Field(fs, fid))?;
        self.on_field_allocated(fs, fid, size);
        Ok(fid)
    }

    /// Allocate one field per entry of `sizes`.
    fn allocate_fields(
        &self,
        fs: FieldSpaceId,
        sizes: &[u32],
    ) -> Result<Vec<FieldId>, ContextError> {
        sizes.iter().map(|&s| self.allocate_field(fs, s)).collect()
    }

    /// Free a field.
    fn free_field(&self, fs: FieldSpaceId, fid: FieldId) -> Result<DeletionOutcome, ContextError> {
        self.strategy().record_call("free_field");
        self.delete_resource(Resource::Field(fs, fid))
    }

    /// Free several fields.
    fn free_fields(
        &self,
        fs: FieldSpaceId,
        fids: &[FieldId],
    ) -> Result<Vec<DeletionOutcome>, ContextError> {
        fids.iter().map(|&f| self.free_field(fs, f)).collect()
    }

    /// Create a region tree over `is` and `fs`.
    fn create_logical_region(
        &self,
        is: IndexSpaceId,
        fs: FieldSpaceId,
    ) -> Result<LogicalRegion, ContextError> {
        self.strategy().record_call("create_logical_region");
        if self.runtime().forest().index_space_bounds(is).is_none() {
            return Err(ContextError::UnknownResource {
                kind: ResourceKind::IndexSpace,
                id: is.0,
            });
        }
        let tree = RegionTreeId(self.strategy().allocate(self.runtime(), IdKind::RegionTree)?);
        let region = LogicalRegion {
            tree,
            index_space: is,
            field_space: fs,
        };
        self.runtime().forest().create_region(region);
        self.track_resource(Resource::Region(region))?;
        Ok(region)
    }

    /// Partition `parent` into `colors` near-equal pieces.
    fn create_equal_partition(
        &self,
        parent: IndexSpaceId,
        colors: usize,
    ) -> Result<IndexPartitionId, ContextError> {
        self.strategy().record_call("create_equal_partition");
        let bounds = self.runtime().forest().index_space_bounds(parent).ok_or(
            ContextError::UnknownResource {
                kind: ResourceKind::IndexSpace,
                id: parent.0,
            },
        )?;
        let mut subspaces = Vec::with_capacity(colors);
        for piece in equal_split(&bounds, colors) {
            let id = IndexSpaceId(self.strategy().allocate(self.runtime(), IdKind::IndexSpace)?);
            self.runtime().forest().create_index_space(id, piece);
            subspaces.push(id);
        }
        let pid = IndexPartitionId(
            self.strategy()
                .allocate(self.runtime(), IdKind::IndexPartition)?,
        );
        self.runtime().forest().create_partition(pid, parent, &subspaces);
        self.track_resource(Resource::IndexPartition(pid))?;
        Ok(pid)
    }

    /// Destroy an index space.
    fn destroy_index_space(&self, id: IndexSpaceId) -> Result<DeletionOutcome, ContextError> {
        self.strategy().record_call("destroy_index_space");
        self.delete_resource(Resource::IndexSpace(id))
    }

    /// Destroy an index partition.
    fn destroy_index_partition(
        &self,
        id: IndexPartitionId,
    ) -> Result<DeletionOutcome, ContextError> {
        self.strategy().record_call("destroy_index_partition");
        self.delete_resource(Resource::IndexPartition(id))
    }

    /// Destroy a field space.
    fn destroy_field_space(&self, id: FieldSpaceId) -> Result<DeletionOutcome, ContextError> {
        self.strategy().record_call("destroy_field_space");
        self.delete_resource(Resource::FieldSpace(id))
    }

    /// Destroy a region tree.
    fn destroy_logical_region(
        &self,
        region: LogicalRegion,
    ) -> Result<DeletionOutcome, ContextError> {
        self.strategy().record_call("destroy_logical_region");
        self.delete_resource(Resource::Region(region))
    }

    /// Add a use to `resource`; it is destroyed once every use is deleted.
    fn create_shared_ownership(&self, resource: Resource) -> Result<u32, ContextError> {
        self.strategy().record_call("create_shared_ownership");
        self.share_resource(resource)
    }
}
