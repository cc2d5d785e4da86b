//! Per-node runtime state shared by every context on the node.
//!
//! A [`Runtime`] owns what contexts on one node have in common: the
//! barrier substrate, the region forest, the identifier allocator, the
//! meta-task scheduler, the ownership ledger for distributed objects, the
//! collector for remote equivalence-set reports, and the registry routing
//! node-level messages to contexts. A [`Cluster`] wires several runtimes
//! to one [`Network`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, warn};
use weft_core::{
    BarrierSubstrate, ContextError, DistributedId, NodeId, ProtocolError, ReductionOpId,
    SubstrateConfig,
};
use weft_eqset::{EquivalenceSet, OwnershipLedger, ReportCollector, SetOverlap};
use weft_pipeline::{Scheduler, WorkerPool};

use crate::config::{ConfigError, ContextConfig};
use crate::forest::{InMemoryForest, RegionForest};
use crate::message::Message;
use crate::registry::{Deliver, Delivery, PendingRegistry};
use crate::transport::{Inbox, Network};

// ── Identifier allocation ──────────────────────────────────────────

/// Kinds of globally unique identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    /// Distributed ids of contexts, views and other distributed objects.
    Distributed,
    /// Index spaces.
    IndexSpace,
    /// Index partitions.
    IndexPartition,
    /// Field spaces.
    FieldSpace,
    /// Fields.
    Field,
    /// Region trees.
    RegionTree,
    /// Dynamic trace, task, mapper, projection and sharding ids.
    Dynamic,
    /// Equivalence sets.
    EquivalenceSet,
}

impl IdKind {
    /// Every kind, in allocator-shard order.
    pub const ALL: [IdKind; 8] = [
        IdKind::Distributed,
        IdKind::IndexSpace,
        IdKind::IndexPartition,
        IdKind::FieldSpace,
        IdKind::Field,
        IdKind::RegionTree,
        IdKind::Dynamic,
        IdKind::EquivalenceSet,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Shard that allocates this kind in a launch of `total_shards`.
    pub fn allocator_shard(self, total_shards: usize) -> usize {
        self.slot() % total_shards.max(1)
    }

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Distributed => "distributed",
            Self::IndexSpace => "index-space",
            Self::IndexPartition => "index-partition",
            Self::FieldSpace => "field-space",
            Self::Field => "field",
            Self::RegionTree => "region-tree",
            Self::Dynamic => "dynamic",
            Self::EquivalenceSet => "equivalence-set",
        }
    }
}

/// Monotonic per-kind identifier counters. Ids start at one.
#[derive(Debug)]
pub struct IdAllocator {
    counters: [AtomicU64; 8],
}

impl IdAllocator {
    /// Fresh counters.
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(1)),
        }
    }

    /// Next identifier of `kind`.
    pub fn next(&self, kind: IdKind) -> u64 {
        self.counters[kind.slot()].fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Reductions ─────────────────────────────────────────────────────

/// Folds two reduction values into one.
pub type ReductionFn = Arc<dyn Fn(&[u8], &[u8]) -> Vec<u8> + Send + Sync>;

/// Built-in sum over little-endian `u64` values.
pub const SUM_U64: ReductionOpId = ReductionOpId(1);

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

fn sum_u64(a: &[u8], b: &[u8]) -> Vec<u8> {
    read_u64(a).wrapping_add(read_u64(b)).to_le_bytes().to_vec()
}

// ── Context routing ────────────────────────────────────────────────

/// A context that accepts node-level messages.
pub trait ContextHandler: Send + Sync {
    /// Handle a message addressed to this context.
    fn handle_message(&self, from: NodeId, msg: Message);
}

struct WeakHandler(Weak<dyn ContextHandler>);

impl Deliver<(NodeId, Message)> for WeakHandler {
    fn deliver(&self, (from, msg): (NodeId, Message)) {
        match self.0.upgrade() {
            Some(h) => h.handle_message(from, msg),
            None => debug!(kind = %msg.kind(), "message for a dropped context ignored"),
        }
    }
}

// ── Runtime ────────────────────────────────────────────────────────

/// Collaborators of a [`Runtime`].
pub struct RuntimeParts {
    /// This node.
    pub node: NodeId,
    /// Configuration applied to contexts created on the node.
    pub config: ContextConfig,
    /// Meta-task scheduler.
    pub scheduler: Arc<dyn Scheduler>,
    /// Region forest.
    pub forest: Arc<dyn RegionForest>,
    /// Identifier allocator, shared by every node of a cluster.
    pub ids: Arc<IdAllocator>,
    /// Barrier substrate, shared by every node of a cluster.
    pub substrate: Arc<BarrierSubstrate>,
}

/// State shared by every context on one node.
pub struct Runtime {
    this: Weak<Runtime>,
    node: NodeId,
    config: ContextConfig,
    scheduler: Arc<dyn Scheduler>,
    forest: Arc<dyn RegionForest>,
    ids: Arc<IdAllocator>,
    substrate: Arc<BarrierSubstrate>,
    ledger: OwnershipLedger,
    reports: ReportCollector,
    contexts: PendingRegistry<DistributedId, (NodeId, Message)>,
    network: OnceLock<Arc<Network>>,
    reductions: RwLock<HashMap<ReductionOpId, ReductionFn>>,
}

impl Runtime {
    /// Single-node runtime with an in-memory forest.
    pub fn new(
        node: NodeId,
        config: ContextConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_parts(RuntimeParts {
            node,
            config,
            scheduler,
            forest: Arc::new(InMemoryForest::new()),
            ids: Arc::new(IdAllocator::new()),
            substrate: Arc::new(BarrierSubstrate::new(SubstrateConfig::default())),
        })
    }

    /// Single-node runtime running meta-tasks on its own worker pool,
    /// sized by [`ContextConfig::resolved_worker_count`].
    pub fn start(config: ContextConfig) -> Result<Arc<Self>, ConfigError> {
        let pool = WorkerPool::new(config.resolved_worker_count()).map_err(|e| {
            ConfigError::ThreadSpawnFailed {
                reason: format!("meta-task pool: {e}"),
            }
        })?;
        Self::new(NodeId(0), config, Arc::new(pool))
    }

    /// Runtime from explicit collaborators. Validates the configuration.
    pub fn with_parts(parts: RuntimeParts) -> Result<Arc<Self>, ConfigError> {
        parts.config.validate()?;
        let bound = parts.config.max_pending_messages;
        let runtime = Arc::new_cyclic(|this| Runtime {
            this: this.clone(),
            node: parts.node,
            config: parts.config,
            scheduler: parts.scheduler,
            forest: parts.forest,
            ids: parts.ids,
            substrate: parts.substrate,
            ledger: OwnershipLedger::new(),
            reports: ReportCollector::new(),
            contexts: PendingRegistry::new("contexts", bound),
            network: OnceLock::new(),
            reductions: RwLock::new(HashMap::new()),
        });
        runtime
            .reductions
            .write()
            .insert(SUM_U64, Arc::new(sum_u64));
        debug!(node = %runtime.node, "runtime started");
        Ok(runtime)
    }

    /// Attach this node to `network`. A node joins at most one network.
    pub fn connect(&self, network: Arc<Network>) -> Result<(), ConfigError> {
        let inbox: Weak<dyn Inbox> = self.this.clone();
        network.attach(self.node, inbox)?;
        self.network
            .set(network)
            .map_err(|_| ConfigError::ThreadSpawnFailed {
                reason: format!("node {} is already connected", self.node),
            })
    }

    /// This node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Context configuration of the node.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Meta-task scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Region forest.
    pub fn forest(&self) -> &Arc<dyn RegionForest> {
        &self.forest
    }

    /// Barrier substrate.
    pub fn substrate(&self) -> &Arc<BarrierSubstrate> {
        &self.substrate
    }

    /// Ownership ledger of distributed objects on this node.
    pub fn ledger(&self) -> &OwnershipLedger {
        &self.ledger
    }

    /// Pending remote equivalence-set requests.
    pub fn reports(&self) -> &ReportCollector {
        &self.reports
    }

    /// Allocate an identifier locally. Replicated contexts go through
    /// their allocator shard instead.
    pub fn allocate(&self, kind: IdKind) -> u64 {
        self.ids.next(kind)
    }

    /// Route messages for `did` to `handler`, replaying any that arrived
    /// first.
    pub fn register_context(
        &self,
        did: DistributedId,
        handler: Weak<dyn ContextHandler>,
    ) -> Result<usize, ContextError> {
        Ok(self
            .contexts
            .register(did, Arc::new(WeakHandler(handler)))?)
    }

    /// Stop routing messages to `did`.
    pub fn unregister_context(&self, did: DistributedId) {
        self.contexts.unregister(&did);
    }

    /// Send `msg` to `to`.
    ///
    /// A message to this node is handled on the calling thread when no
    /// network is attached.
    pub fn send(&self, to: NodeId, msg: Message) -> Result<(), ContextError> {
        match self.network.get() {
            Some(net) => Ok(net.send(self.node, to, &msg)?),
            None if to == self.node => {
                self.handle(self.node, msg);
                Ok(())
            }
            None => Err(ProtocolError::Undeliverable {
                node: to,
                detail: "node is not connected".into(),
            }
            .into()),
        }
    }

    /// Register a reduction operator.
    pub fn register_reduction(
        &self,
        id: ReductionOpId,
        f: ReductionFn,
    ) -> Result<(), ContextError> {
        let mut reductions = self.reductions.write();
        if reductions.contains_key(&id) {
            return Err(ContextError::IllegalCall {
                call: "register_reduction",
                reason: format!("reduction {id} already registered"),
            });
        }
        reductions.insert(id, f);
        Ok(())
    }

    /// The reduction operator `id`.
    pub fn reduction(&self, id: ReductionOpId) -> Option<ReductionFn> {
        self.reductions.read().get(&id).cloned()
    }

    /// Fold `values` with reduction `id`; `None` for no values.
    pub fn fold(&self, id: ReductionOpId, values: &[Vec<u8>]) -> Option<Vec<u8>> {
        let f = self.reduction(id)?;
        let (first, rest) = values.split_first()?;
        Some(rest.iter().fold(first.clone(), |acc, v| f(&acc, v)))
    }
}

impl Inbox for Runtime {
    fn handle(&self, from: NodeId, msg: Message) {
        match msg {
            Message::EqSetResponse { request, sets } => {
                let sets = sets
                    .into_iter()
                    .map(|s| SetOverlap {
                        set: Arc::new(EquivalenceSet::new(s.did, s.owner, s.bounds)),
                        mask: s.mask,
                    })
                    .collect();
                if let Err(e) = self.reports.report(request, from, sets) {
                    error!(
                        node = %self.node,
                        from = %from,
                        error = %e,
                        "bad equivalence-set report"
                    );
                }
            }
            msg => match msg.context() {
                Some(did) => match self.contexts.find_or_buffer(did, (from, msg)) {
                    Ok(Delivery::Delivered | Delivery::Dropped) => {}
                    Ok(Delivery::Buffered { count }) => {
                        debug!(node = %self.node, context = %did, count, "message buffered");
                    }
                    Err(e) => error!(node = %self.node, error = %e, "message dropped"),
                },
                None => warn!(
                    node = %self.node,
                    kind = %msg.kind(),
                    "shard message reached the node inbox"
                ),
            },
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.node)
            .field("ledger", &self.ledger.len())
            .field("pending_reports", &self.reports.pending())
            .field("connected", &self.network.get().is_some())
            .finish()
    }
}

// ── Cluster ────────────────────────────────────────────────────────

/// Several runtimes joined by one network.
///
/// Nodes share the identifier allocator and the barrier substrate.
#[derive(Debug)]
pub struct Cluster {
    network: Arc<Network>,
    nodes: Vec<Arc<Runtime>>,
}

impl Cluster {
    /// `nodes` connected runtimes with in-memory forests.
    pub fn new(
        nodes: usize,
        config: ContextConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, ConfigError> {
        let network = Network::new(nodes);
        let ids = Arc::new(IdAllocator::new());
        let substrate = Arc::new(BarrierSubstrate::new(SubstrateConfig::default()));
        let mut runtimes = Vec::with_capacity(nodes);
        for n in 0..nodes {
            let rt = Runtime::with_parts(RuntimeParts {
                node: NodeId(n as u32),
                config: config.clone(),
                scheduler: Arc::clone(&scheduler),
                forest: Arc::new(InMemoryForest::new()),
                ids: Arc::clone(&ids),
                substrate: Arc::clone(&substrate),
            })?;
            rt.connect(Arc::clone(&network))?;
            runtimes.push(rt);
        }
        Ok(Self {
            network,
            nodes: runtimes,
        })
    }

    /// Runtime of node `n`.
    pub fn node(&self, n: usize) -> Option<&Arc<Runtime>> {
        self.nodes.get(n)
    }

    /// Every runtime, by node number.
    pub fn nodes(&self) -> &[Arc<Runtime>] {
        &self.nodes
    }

    /// Stop message delivery.
    pub fn shutdown(&self) {
        self.network.shutdown();
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Runtime>();
    assert::<IdAllocator>();
    assert::<Cluster>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use weft_eqset::Rect;
    use weft_pipeline::ManualScheduler;

    use crate::message::SetReport;

    fn runtime() -> Arc<Runtime> {
        Runtime::new(
            NodeId(0),
            ContextConfig::default(),
            Arc::new(ManualScheduler::new()),
        )
        .unwrap()
    }

    #[test]
    fn allocator_shards_rotate_by_kind() {
        assert_eq!(IdKind::Distributed.allocator_shard(4), 0);
        assert_eq!(IdKind::IndexSpace.allocator_shard(4), 1);
        assert_eq!(IdKind::Field.allocator_shard(4), 0);
        assert_eq!(IdKind::EquivalenceSet.allocator_shard(4), 3);
        assert_eq!(IdKind::EquivalenceSet.allocator_shard(1), 0);
    }

    #[test]
    fn ids_are_per_kind_and_start_at_one() {
        let rt = runtime();
        assert_eq!(rt.allocate(IdKind::Field), 1);
        assert_eq!(rt.allocate(IdKind::Field), 2);
        assert_eq!(rt.allocate(IdKind::RegionTree), 1);
    }

    #[test]
    fn sum_reduction_is_builtin() {
        let rt = runtime();
        let values: Vec<Vec<u8>> = (1..=4u64).map(|v| v.to_le_bytes().to_vec()).collect();
        let sum = rt.fold(SUM_U64, &values).unwrap();
        assert_eq!(read_u64(&sum), 10);
        assert!(rt.register_reduction(SUM_U64, Arc::new(sum_u64)).is_err());
        assert!(rt.fold(ReductionOpId(77), &values).is_none());
    }

    struct Record(Mutex<Vec<Message>>);

    impl ContextHandler for Record {
        fn handle_message(&self, _from: NodeId, msg: Message) {
            self.0.lock().push(msg);
        }
    }

    #[test]
    fn context_messages_wait_for_registration() {
        let rt = runtime();
        let did = DistributedId(5);
        rt.send(NodeId(0), Message::RemoteRelease { context: did })
            .unwrap();
        let rec = Arc::new(Record(Mutex::new(Vec::new())));
        let handler: Arc<dyn ContextHandler> = rec.clone();
        assert_eq!(rt.register_context(did, Arc::downgrade(&handler)), Ok(1));
        assert_eq!(rec.0.lock().len(), 1);
    }

    #[test]
    fn cluster_routes_eqset_responses_to_reports() {
        let cluster = Cluster::new(
            2,
            ContextConfig::default(),
            Arc::new(ManualScheduler::new()),
        )
        .unwrap();
        let (a, b) = (cluster.node(0).unwrap(), cluster.node(1).unwrap());
        let (request, ready) = a.reports().open([NodeId(1)]);
        b.send(
            NodeId(0),
            Message::EqSetResponse {
                request,
                sets: vec![SetReport {
                    did: DistributedId(3),
                    owner: NodeId(1),
                    bounds: Rect::line(0, 9),
                    mask: weft_core::FieldMask::first_n(2),
                }],
            },
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready.has_triggered() {
            assert!(Instant::now() < deadline, "report never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
        let sets = a.reports().take(request).unwrap().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].set.did, DistributedId(3));
        cluster.shutdown();
    }
}
