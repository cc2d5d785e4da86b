//! Test utilities and mock types for weft development.
//!
//! Provides a [`RecordingForest`] that remembers when each resource was
//! destroyed relative to a set of watched events, [`GatedOp`] for issuing
//! operations whose effects finish only when a test says so, and the
//! runtime and shard fixtures in [`fixtures`] and [`shards`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;
pub mod shards;

use std::sync::{Arc, Once};

use parking_lot::Mutex;
use weft_context::{InMemoryForest, RegionForest, Resource};
use weft_core::{Event, FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, LogicalRegion};
use weft_eqset::Rect;
use weft_pipeline::{Execution, FnBehavior, OpKind, OpSpec, Operation, RegionRequirement};

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output to the test writer, filtered by `RUST_LOG`
/// (default `warn`). Later calls are no-ops.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// One call to [`RegionForest::destroy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestroyRecord {
    pub resource: Resource,
    /// Whether every watched event had triggered when the destroy ran.
    pub after_watched: bool,
}

/// Region forest recording each destruction.
///
/// Creation calls go to an inner [`InMemoryForest`]. Register the events a
/// destruction must follow with [`watch`](RecordingForest::watch); each
/// [`DestroyRecord`] notes whether they had all triggered by then.
#[derive(Debug, Default)]
pub struct RecordingForest {
    inner: InMemoryForest,
    watched: Mutex<Vec<Event>>,
    records: Mutex<Vec<DestroyRecord>>,
}

impl RecordingForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event every later destruction should follow.
    pub fn watch(&self, event: Event) {
        self.watched.lock().push(event);
    }

    /// Every destruction, in order.
    pub fn records(&self) -> Vec<DestroyRecord> {
        self.records.lock().clone()
    }

    /// How many times `resource` was destroyed.
    pub fn destroy_count(&self, resource: &Resource) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.resource == *resource)
            .count()
    }

    /// The backing forest.
    pub fn inner(&self) -> &InMemoryForest {
        &self.inner
    }
}

impl RegionForest for RecordingForest {
    fn create_index_space(&self, id: IndexSpaceId, bounds: Rect) {
        self.inner.create_index_space(id, bounds);
    }

    fn create_partition(
        &self,
        id: IndexPartitionId,
        parent: IndexSpaceId,
        subspaces: &[IndexSpaceId],
    ) {
        self.inner.create_partition(id, parent, subspaces);
    }

    fn index_space_bounds(&self, id: IndexSpaceId) -> Option<Rect> {
        self.inner.index_space_bounds(id)
    }

    fn partition_subspaces(&self, id: IndexPartitionId) -> Option<Vec<IndexSpaceId>> {
        self.inner.partition_subspaces(id)
    }

    fn create_field_space(&self, id: FieldSpaceId) {
        self.inner.create_field_space(id);
    }

    fn allocate_field(&self, fs: FieldSpaceId, fid: FieldId, size: u32) {
        self.inner.allocate_field(fs, fid, size);
    }

    fn create_region(&self, region: LogicalRegion) {
        self.inner.create_region(region);
    }

    fn destroy(&self, resource: &Resource) {
        let after_watched = self.watched.lock().iter().all(Event::has_triggered);
        self.inner.destroy(resource);
        self.records.lock().push(DestroyRecord {
            resource: *resource,
            after_watched,
        });
    }
}

/// An operation whose effects finish when [`open`](GatedOp::open) is
/// called.
pub struct GatedOp {
    gate: weft_core::UserEvent,
}

impl GatedOp {
    pub fn new() -> Self {
        Self {
            gate: weft_core::UserEvent::new(),
        }
    }

    /// Spec of `kind` over `requirements` whose effects wait on the gate.
    pub fn spec(&self, kind: OpKind, requirements: &[RegionRequirement]) -> OpSpec {
        let effects = self.gate.event();
        let mut spec = OpSpec::new(kind)
            .with_label("gated")
            .with_behavior(Arc::new(FnBehavior(move |_: &Operation| Execution {
                effects: effects.clone(),
                value: None,
            })));
        for req in requirements {
            spec = spec.with_requirement(req.clone());
        }
        spec
    }

    /// Finish the gated effects. Returns `false` if already open.
    pub fn open(&self) -> bool {
        self.gate.trigger()
    }

    /// The gate.
    pub fn event(&self) -> Event {
        self.gate.event()
    }
}

impl Default for GatedOp {
    fn default() -> Self {
        Self::new()
    }
}
