//! Runtimes, regions and requirements for context tests.
//!
//! - [`manual_runtime`]: a runtime whose meta-tasks run only when the test
//!   calls [`ManualScheduler::run_until_idle`].
//! - [`pooled_runtime`]: a runtime backed by a [`WorkerPool`].
//! - [`recording_runtime`]: a manual runtime over a [`RecordingForest`].

use std::sync::Arc;

use weft_context::{ContextConfig, ResourceOwner, Runtime, RuntimeParts};
use weft_core::{BarrierSubstrate, ContextError, FieldMask, LogicalRegion, NodeId};
use weft_eqset::Rect;
use weft_pipeline::{ManualScheduler, RegionRequirement, WorkerPool};

use crate::RecordingForest;

/// Runtime on node 0 driven by a [`ManualScheduler`].
pub fn manual_runtime(config: ContextConfig) -> (Arc<ManualScheduler>, Arc<Runtime>) {
    let sched = Arc::new(ManualScheduler::new());
    let rt = Runtime::new(NodeId(0), config, sched.clone()).expect("valid config");
    (sched, rt)
}

/// Runtime on node 0 driven by `workers` worker threads.
pub fn pooled_runtime(config: ContextConfig, workers: usize) -> Arc<Runtime> {
    let pool = WorkerPool::new(workers).expect("worker pool");
    Runtime::new(NodeId(0), config, Arc::new(pool)).expect("valid config")
}

/// Manual runtime whose region forest records destructions.
pub fn recording_runtime(
    config: ContextConfig,
) -> (Arc<ManualScheduler>, Arc<RecordingForest>, Arc<Runtime>) {
    let sched = Arc::new(ManualScheduler::new());
    let forest = Arc::new(RecordingForest::new());
    let rt = Runtime::with_parts(RuntimeParts {
        node: NodeId(0),
        config,
        scheduler: sched.clone(),
        forest: forest.clone(),
        ids: Arc::new(weft_context::runtime::IdAllocator::new()),
        substrate: Arc::new(BarrierSubstrate::new(Default::default())),
    })
    .expect("valid config");
    (sched, forest, rt)
}

/// A fresh region over `bounds` with `fields` eight-byte fields.
pub fn region(
    ctx: &dyn ResourceOwner,
    bounds: Rect,
    fields: usize,
) -> Result<LogicalRegion, ContextError> {
    let is = ctx.create_index_space(bounds)?;
    let fs = ctx.create_field_space()?;
    for _ in 0..fields {
        ctx.allocate_field(fs, 8)?;
    }
    ctx.create_logical_region(is, fs)
}

/// Read-write requirement on the first `fields` fields of `region`.
pub fn write(region: LogicalRegion, fields: u32) -> RegionRequirement {
    RegionRequirement::read_write(region, FieldMask::first_n(fields))
}

/// Read-only requirement on the first `fields` fields of `region`.
pub fn read(region: LogicalRegion, fields: u32) -> RegionRequirement {
    RegionRequirement::read_only(region, FieldMask::first_n(fields))
}
