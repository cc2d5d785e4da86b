//! Barrier pools of a replicated launch.
//!
//! Every recurring synchronization point of a replicated context draws its
//! barriers from a pool. Pools are driven by identical call sequences on
//! every shard, so the n-th `next()` on one shard names the same barrier
//! generation as the n-th `next()` on every other shard. Barriers are
//! created lazily through the launch's [`BarrierDirectory`], which hands
//! every shard the same barrier for the same key.
//!
//! Phase barriers have a bounded number of generations. Pools that hand out
//! consecutive pairs ([`PairedBarrierPool`]) detect when a pair would
//! straddle the end of a barrier's phases and retire the stale generation
//! before returning a matched pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use weft_core::{BarrierSubstrate, ContextError, PhaseBarrier, ProtocolError};

use crate::metrics::ContextMetrics;

/// Recurring synchronization points of a replicated context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierTag {
    /// Mapping fences.
    MappingFence,
    /// Execution fences.
    ExecutionFence,
    /// Resource return at task end.
    ResourceReturn,
    /// Attach and detach of external data.
    AttachDetach,
    /// Close operations that have mapped.
    CloseMapped,
    /// Equivalence-set refinement may start.
    RefinementReady,
    /// Equivalence-set refinement has mapped.
    RefinementMapped,
    /// Collective-view mapping (paired).
    CollectiveMap,
    /// Indirect-copy completion (paired).
    Indirection,
}

impl BarrierTag {
    /// Stable name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::MappingFence => "mapping-fence",
            Self::ExecutionFence => "execution-fence",
            Self::ResourceReturn => "resource-return",
            Self::AttachDetach => "attach-detach",
            Self::CloseMapped => "close-mapped",
            Self::RefinementReady => "refinement-ready",
            Self::RefinementMapped => "refinement-mapped",
            Self::CollectiveMap => "collective-map",
            Self::Indirection => "indirection",
        }
    }
    /// Whether the tag names a pool drawn in matched pairs.
    pub fn is_paired(self) -> bool {
        matches!(self, Self::CollectiveMap | Self::Indirection)
    }
}

impl fmt::Display for BarrierTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Directory ──────────────────────────────────────────────────────

/// Key under which a launch creates a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierKey {
    /// Slot of a named pool.
    Named {
        /// The pool.
        tag: BarrierTag,
        /// Slot within the pool.
        slot: usize,
    },
    /// The n-th barrier the application created.
    Sequence(u64),
}

/// Arrival count of a pooled barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierMode {
    /// One arrival per shard.
    Replicate,
    /// A single arrival, from the shard doing the work.
    Single,
}

/// Barriers of one replicated launch, by key.
pub struct BarrierDirectory {
    substrate: Arc<BarrierSubstrate>,
    participants: usize,
    barriers: Mutex<HashMap<BarrierKey, PhaseBarrier>>,
}

impl BarrierDirectory {
    /// Directory for `participants` shards.
    pub fn new(substrate: Arc<BarrierSubstrate>, participants: usize) -> Self {
        Self {
            substrate,
            participants: participants.max(1),
            barriers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of shards.
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// The substrate barriers live in.
    pub fn substrate(&self) -> &Arc<BarrierSubstrate> {
        &self.substrate
    }

    /// The barrier for `key`, created with `arrivals` on first use.
    pub fn get_or_create(&self, key: BarrierKey, arrivals: usize) -> PhaseBarrier {
        *self.barriers.lock().entry(key).or_insert_with(|| {
            let b = self.substrate.create_barrier(arrivals);
            debug!(?key, barrier = %b, arrivals, "barrier created");
            b
        })
    }

    /// Arrival count for `mode`.
    pub fn arrivals(&self, mode: BarrierMode) -> usize {
        match mode {
            BarrierMode::Replicate => self.participants,
            BarrierMode::Single => 1,
        }
    }

    /// Number of barriers created so far.
    pub fn len(&self) -> usize {
        self.barriers.lock().len()
    }

    /// Whether no barrier was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for BarrierDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierDirectory")
            .field("participants", &self.participants)
            .field("barriers", &self.len())
            .finish()
    }
}

// ── ReplBarrier ────────────────────────────────────────────────────

/// One lazily created barrier and this shard's cursor into its phases.
#[derive(Clone, Debug)]
pub struct ReplBarrier {
    key: BarrierKey,
    mode: BarrierMode,
    current: Option<PhaseBarrier>,
}

impl ReplBarrier {
    /// Barrier expecting one arrival per shard.
    pub fn replicate(key: BarrierKey) -> Self {
        Self {
            key,
            mode: BarrierMode::Replicate,
            current: None,
        }
    }

    /// Barrier expecting a single arrival.
    pub fn single(key: BarrierKey) -> Self {
        Self {
            key,
            mode: BarrierMode::Single,
            current: None,
        }
    }

    /// Arrival count mode.
    pub fn mode(&self) -> BarrierMode {
        self.mode
    }

    /// Return the current generation and advance past it.
    pub fn next(&mut self, dir: &BarrierDirectory) -> Result<PhaseBarrier, ContextError> {
        let current = match self.current {
            Some(b) => b,
            None => dir.get_or_create(self.key, dir.arrivals(self.mode)),
        };
        self.current = Some(dir.substrate().advance(current)?);
        trace!(key = ?self.key, barrier = %current, "barrier generation taken");
        Ok(current)
    }

    /// The generation the next call to [`next`](Self::next) returns, once
    /// the barrier exists.
    pub fn peek(&self) -> Option<PhaseBarrier> {
        self.current
    }
}

// ── Pools ──────────────────────────────────────────────────────────

/// Fixed number of barriers used in rotation.
#[derive(Clone, Debug)]
pub struct RotatingPool {
    tag: BarrierTag,
    slots: Vec<ReplBarrier>,
    cursor: usize,
}

impl RotatingPool {
    /// Pool of `size` replicate barriers.
    pub fn replicate(tag: BarrierTag, size: usize) -> Self {
        Self::with(tag, size, ReplBarrier::replicate)
    }

    /// Pool of `size` single-arrival barriers.
    pub fn single(tag: BarrierTag, size: usize) -> Self {
        Self::with(tag, size, ReplBarrier::single)
    }

    fn with(tag: BarrierTag, size: usize, make: fn(BarrierKey) -> ReplBarrier) -> Self {
        Self {
            tag,
            slots: (0..size.max(1))
                .map(|slot| make(BarrierKey::Named { tag, slot }))
                .collect(),
            cursor: 0,
        }
    }

    /// Pool name.
    pub fn tag(&self) -> BarrierTag {
        self.tag
    }

    /// Number of barriers in rotation.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Next generation from the next barrier in rotation.
    pub fn next(&mut self, dir: &BarrierDirectory) -> Result<PhaseBarrier, ContextError> {
        let slot = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots[slot].next(dir)
    }
}

/// Rotating pool handing out consecutive generation pairs.
///
/// The second barrier of a pair must be the phase directly after the
/// first. When the first is the last phase of its barrier the substrate
/// moves on to a successor barrier, and the pair no longer lines up; the
/// stale generation is then arrived on, so shards waiting on it are not
/// stranded, and the pair is taken again from the successor.
#[derive(Clone, Debug)]
pub struct PairedBarrierPool {
    pool: RotatingPool,
}

impl PairedBarrierPool {
    /// Pool of `size` replicate barriers.
    pub fn new(tag: BarrierTag, size: usize) -> Self {
        Self {
            pool: RotatingPool::replicate(tag, size),
        }
    }

    /// Pool name.
    pub fn tag(&self) -> BarrierTag {
        self.pool.tag
    }

    /// Next matched `(current, next)` pair.
    pub fn next_pair(
        &mut self,
        dir: &BarrierDirectory,
        metrics: &ContextMetrics,
    ) -> Result<(PhaseBarrier, PhaseBarrier), ContextError> {
        let slot = self.pool.cursor;
        self.pool.cursor = (slot + 1) % self.pool.slots.len();
        let barrier = &mut self.pool.slots[slot];
        let mut current = barrier.next(dir)?;
        let mut next = barrier.next(dir)?;
        let substrate = dir.substrate();
        if substrate.previous_phase(next) != current {
            debug!(
                pool = %self.pool.tag,
                stale = %current,
                successor = %next,
                "phase wraparound; retiring stale generation"
            );
            substrate.arrive(current, 1)?;
            metrics.record_wraparound_repair();
            current = next;
            next = barrier.next(dir)?;
            if substrate.previous_phase(next) != current {
                return Err(ProtocolError::BarrierMismatch {
                    pool: self.pool.tag.name(),
                    detail: format!("{current} and {next} are not consecutive"),
                }
                .into());
            }
        }
        Ok((current, next))
    }
}
