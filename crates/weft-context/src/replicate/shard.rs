//! Shared state of a replicated launch and the per-shard strategy.
//!
//! A [`ShardManager`] is created once per launch and shared by every shard
//! running on the node. It owns the barrier directory and one set of
//! message registries per shard.
//! Each shard's inner context is driven by a [`ShardedStrategy`], which
//! keeps that shard's barrier cursors, collective counters and call hash.
//! All shards make the same calls in the same order, so their counters and
//! cursors agree without coordination.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use weft_core::{CollectiveId, ContextError, DistributedId, PhaseBarrier, ProtocolError, ShardId};

use crate::config::{ConfigError, ReplicationConfig};
use crate::context::ReplicationStrategy;
use crate::hash::CallHasher;
use crate::message::Message;
use crate::metrics::ContextMetrics;
use crate::registry::{Delivery, PendingRegistry};
use crate::replicate::barrier::{
    BarrierDirectory, BarrierKey, BarrierTag, PairedBarrierPool, ReplBarrier, RotatingPool,
};
use crate::replicate::collective::{decode_u64s, ShardPayload, ValueBroadcast};
use crate::runtime::{IdKind, Runtime};
use crate::wire;

struct ShardRegistries {
    collectives: PendingRegistry<CollectiveId, ShardPayload>,
    rendezvous: PendingRegistry<u64, ShardPayload>,
    templates: PendingRegistry<u64, ShardPayload>,
}

/// State shared by the shards of one replicated launch.
pub struct ShardManager {
    runtime: Arc<Runtime>,
    config: ReplicationConfig,
    directory: BarrierDirectory,
    registries: Vec<ShardRegistries>,
    metrics: Vec<Arc<ContextMetrics>>,
}

impl ShardManager {
    /// Manager for `config.total_shards` shards on `runtime`'s node.
    pub fn new(
        runtime: Arc<Runtime>,
        config: ReplicationConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let total = config.total_shards;
        let bound = runtime.config().max_pending_messages;
        let registries = (0..total)
            .map(|_| ShardRegistries {
                collectives: PendingRegistry::new("collectives", bound),
                rendezvous: PendingRegistry::new("shard_rendezvous", bound),
                templates: PendingRegistry::new("physical_templates", bound),
            })
            .collect();
        let directory = BarrierDirectory::new(Arc::clone(runtime.substrate()), total);
        debug!(shards = total, node = %runtime.node(), "replicated launch prepared");
        Ok(Arc::new(Self {
            directory,
            registries,
            metrics: (0..total).map(|_| Arc::new(ContextMetrics::new())).collect(),
            runtime,
            config,
        }))
    }

    /// Node runtime.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Launch configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Number of shards.
    pub fn total(&self) -> usize {
        self.registries.len()
    }

    /// Every shard, in order.
    pub fn shards(&self) -> impl Iterator<Item = ShardId> {
        (0..self.total() as u32).map(ShardId)
    }

    /// Barriers of the launch.
    pub fn directory(&self) -> &BarrierDirectory {
        &self.directory
    }

    /// Counters of `shard`.
    pub fn metrics(&self, shard: ShardId) -> Option<&Arc<ContextMetrics>> {
        self.metrics.get(shard.index())
    }

    fn registries(&self, shard: ShardId) -> Result<&ShardRegistries, ContextError> {
        self.registries
            .get(shard.index())
            .ok_or(ContextError::Protocol(ProtocolError::Disconnected { shard }))
    }

    /// Collective registry of `shard`.
    pub fn collectives(
        &self,
        shard: ShardId,
    ) -> Result<&PendingRegistry<CollectiveId, ShardPayload>, ContextError> {
        Ok(&self.registries(shard)?.collectives)
    }

    /// Rendezvous registry of `shard`.
    pub fn rendezvous(
        &self,
        shard: ShardId,
    ) -> Result<&PendingRegistry<u64, ShardPayload>, ContextError> {
        Ok(&self.registries(shard)?.rendezvous)
    }

    /// Physical-template registry of `shard`.
    pub fn templates(
        &self,
        shard: ShardId,
    ) -> Result<&PendingRegistry<u64, ShardPayload>, ContextError> {
        Ok(&self.registries(shard)?.templates)
    }

    /// Deliver a shard message to `to`, buffering it if its target has not
    /// registered yet. Messages are encoded and decoded on the way, as they
    /// would be between nodes.
    pub fn send(&self, to: ShardId, msg: Message) -> Result<(), ContextError> {
        let bytes = wire::to_bytes(&msg).map_err(|e| malformed(&msg, e.to_string()))?;
        let msg = wire::from_bytes(&bytes).map_err(|e| malformed(&msg, e.to_string()))?;
        let regs = self.registries(to)?;
        let delivery = match msg {
            Message::Collective {
                collective,
                from,
                payload,
            } => regs.collectives.find_or_buffer(collective, (from, payload))?,
            Message::Rendezvous {
                index,
                from,
                payload,
            } => regs.rendezvous.find_or_buffer(index, (from, payload))?,
            Message::TraceUpdate {
                template,
                from,
                payload,
            } => regs.templates.find_or_buffer(template, (from, payload))?,
            other => {
                return Err(ContextError::IllegalCall {
                    call: "shard_send",
                    reason: format!("{} is not a shard message", other.kind()),
                })
            }
        };
        if let Delivery::Buffered { count } = delivery {
            trace!(%to, count, "shard message buffered");
            if let Some(m) = self.metrics(to) {
                m.record_buffered();
            }
        }
        Ok(())
    }
}

fn malformed(msg: &Message, detail: String) -> ContextError {
    let collective = match msg {
        Message::Collective { collective, .. } => *collective,
        _ => CollectiveId(0),
    };
    ProtocolError::Malformed { collective, detail }.into()
}

impl fmt::Debug for ShardManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardManager")
            .field("shards", &self.total())
            .field("barriers", &self.directory.len())
            .finish()
    }
}

// ── Strategy ───────────────────────────────────────────────────────

struct Pools {
    mapping_fence: ReplBarrier,
    execution_fence: ReplBarrier,
    resource_return: ReplBarrier,
    attach_detach: ReplBarrier,
    close_mapped: RotatingPool,
    refinement_ready: RotatingPool,
    refinement_mapped: RotatingPool,
    collective_map: PairedBarrierPool,
    indirection: PairedBarrierPool,
}

impl Pools {
    fn new(config: &ReplicationConfig) -> Self {
        let fixed = |tag| ReplBarrier::replicate(BarrierKey::Named { tag, slot: 0 });
        Self {
            mapping_fence: fixed(BarrierTag::MappingFence),
            execution_fence: fixed(BarrierTag::ExecutionFence),
            resource_return: fixed(BarrierTag::ResourceReturn),
            attach_detach: fixed(BarrierTag::AttachDetach),
            close_mapped: RotatingPool::replicate(BarrierTag::CloseMapped, config.close_pool_size),
            refinement_ready: RotatingPool::replicate(
                BarrierTag::RefinementReady,
                config.refinement_pool_size,
            ),
            refinement_mapped: RotatingPool::replicate(
                BarrierTag::RefinementMapped,
                config.refinement_pool_size,
            ),
            collective_map: PairedBarrierPool::new(
                BarrierTag::CollectiveMap,
                config.collective_map_pool_size,
            ),
            indirection: PairedBarrierPool::new(
                BarrierTag::Indirection,
                config.indirection_pool_size,
            ),
        }
    }
}

/// Replication behavior of one shard.
pub struct ShardedStrategy {
    shard: ShardId,
    manager: Arc<ShardManager>,
    pools: Mutex<Pools>,
    hasher: Mutex<CallHasher>,
    app_collectives: AtomicU64,
    logical_collectives: AtomicU64,
    app_barriers: AtomicU64,
    launches: AtomicU64,
    template_exchanges: AtomicU64,
    origins: AtomicU64,
}

impl ShardedStrategy {
    /// Strategy of `shard`.
    pub fn new(shard: ShardId, manager: Arc<ShardManager>) -> Self {
        Self {
            pools: Mutex::new(Pools::new(manager.config())),
            shard,
            manager,
            hasher: Mutex::new(CallHasher::new()),
            app_collectives: AtomicU64::new(0),
            logical_collectives: AtomicU64::new(0),
            app_barriers: AtomicU64::new(0),
            launches: AtomicU64::new(0),
            template_exchanges: AtomicU64::new(0),
            origins: AtomicU64::new(0),
        }
    }

    /// The launch this shard belongs to.
    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    /// Next collective index on the application call path. Always even.
    pub fn next_collective_id(&self) -> CollectiveId {
        CollectiveId(self.app_collectives.fetch_add(1, Ordering::Relaxed) * 2)
    }

    /// Next collective index assigned during dependence analysis. Always
    /// odd.
    pub fn next_logical_collective_id(&self) -> CollectiveId {
        CollectiveId(self.logical_collectives.fetch_add(1, Ordering::Relaxed) * 2 + 1)
    }

    /// Sequence number of the next replicated task launch.
    pub fn next_launch(&self) -> u64 {
        self.launches.fetch_add(1, Ordering::Relaxed)
    }

    /// Key of the next template exchange.
    pub fn next_template_exchange(&self) -> u64 {
        self.template_exchanges.fetch_add(1, Ordering::Relaxed)
    }

    /// Current call hash and the most recent call.
    pub fn call_hash(&self) -> (u64, &'static str) {
        let h = self.hasher.lock();
        (h.value(), h.last_call())
    }

    /// Number of calls folded into the hash.
    pub fn call_count(&self) -> u64 {
        self.hasher.lock().calls()
    }

    /// Next matched generation pair of a paired pool.
    pub fn next_pair(&self, tag: BarrierTag) -> Result<(PhaseBarrier, PhaseBarrier), ContextError> {
        let metrics = self
            .manager
            .metrics(self.shard)
            .ok_or(ContextError::Protocol(ProtocolError::Disconnected { shard: self.shard }))?;
        let dir = self.manager.directory();
        let mut pools = self.pools.lock();
        match tag {
            BarrierTag::CollectiveMap => pools.collective_map.next_pair(dir, metrics),
            BarrierTag::Indirection => pools.indirection.next_pair(dir, metrics),
            other => Err(ContextError::IllegalCall {
                call: "next_pair",
                reason: format!("{other} is not a paired pool"),
            }),
        }
    }

    /// Value produced once by `owner` and received by every other shard
    /// under `collective`.
    fn agree_on(
        &self,
        collective: CollectiveId,
        owner: ShardId,
        produce: impl FnOnce() -> u64,
    ) -> Result<u64, ContextError> {
        let bc = ValueBroadcast::new(collective, owner);
        if owner == self.shard {
            let value = produce();
            bc.broadcast(&self.manager, value.to_le_bytes().to_vec())?;
            return Ok(value);
        }
        let bytes = bc.receive(&self.manager, self.shard)?;
        match decode_u64s(collective, &bytes)?.as_slice() {
            [value] => Ok(*value),
            _ => Err(ProtocolError::Malformed {
                collective,
                detail: format!("expected one id, got {} bytes", bytes.len()),
            }
            .into()),
        }
    }
}

impl ReplicationStrategy for ShardedStrategy {
    fn shard(&self) -> ShardId {
        self.shard
    }

    fn total_shards(&self) -> usize {
        self.manager.total()
    }

    /// The allocator shard of `kind` allocates and broadcasts; the others
    /// park until the value arrives.
    fn allocate(&self, runtime: &Runtime, kind: IdKind) -> Result<u64, ContextError> {
        let collective = self.next_collective_id();
        let owner = ShardId(kind.allocator_shard(self.manager.total()) as u32);
        let id = self.agree_on(collective, owner, || runtime.allocate(kind))?;
        trace!(shard = %self.shard, kind = kind.name(), id, %collective, %owner, "id agreed");
        Ok(id)
    }

    fn barrier_for(&self, tag: BarrierTag) -> Result<Option<PhaseBarrier>, ContextError> {
        let dir = self.manager.directory();
        let mut pools = self.pools.lock();
        let barrier = match tag {
            BarrierTag::MappingFence => pools.mapping_fence.next(dir)?,
            BarrierTag::ExecutionFence => pools.execution_fence.next(dir)?,
            BarrierTag::ResourceReturn => pools.resource_return.next(dir)?,
            BarrierTag::AttachDetach => pools.attach_detach.next(dir)?,
            BarrierTag::CloseMapped => pools.close_mapped.next(dir)?,
            BarrierTag::RefinementReady => pools.refinement_ready.next(dir)?,
            BarrierTag::RefinementMapped => pools.refinement_mapped.next(dir)?,
            BarrierTag::CollectiveMap | BarrierTag::Indirection => {
                return Err(ContextError::IllegalCall {
                    call: "barrier_for",
                    reason: format!("{tag} barriers are drawn in pairs"),
                })
            }
        };
        Ok(Some(barrier))
    }

    /// The n-th application barrier is the same on every shard.
    fn create_barrier(
        &self,
        _runtime: &Runtime,
        arrivals: usize,
    ) -> Result<PhaseBarrier, ContextError> {
        let n = self.app_barriers.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .manager
            .directory()
            .get_or_create(BarrierKey::Sequence(n), arrivals))
    }

    fn record_call(&self, call: &'static str) {
        self.hasher.lock().record(call);
    }

    /// Round-robin starting at the equivalence-set allocator shard.
    fn next_equivalence_set_origin(&self) -> ShardId {
        let n = self.origins.fetch_add(1, Ordering::Relaxed);
        let total = self.manager.total() as u64;
        let first = IdKind::EquivalenceSet.allocator_shard(self.manager.total()) as u64;
        ShardId(((first + n) % total) as u32)
    }

    /// The origin shard allocates the set's id and broadcasts it under a
    /// logical collective index.
    fn equivalence_set_id(&self, runtime: &Runtime) -> Result<DistributedId, ContextError> {
        let origin = self.next_equivalence_set_origin();
        let collective = self.next_logical_collective_id();
        let id = self.agree_on(collective, origin, || runtime.allocate(IdKind::EquivalenceSet))?;
        trace!(shard = %self.shard, set = id, %origin, %collective, "equivalence set id agreed");
        Ok(DistributedId(id))
    }

    fn owns_point(&self, linear: usize) -> bool {
        linear % self.manager.total() == self.shard.index()
    }
}

impl fmt::Debug for ShardedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedStrategy")
            .field("shard", &self.shard)
            .field("total", &self.manager.total())
            .field("calls", &self.call_count())
            .finish()
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ShardManager>();
    assert::<ShardedStrategy>();
};
