//! Phase barriers with bounded generations.
//!
//! A [`PhaseBarrier`] names one generation of a collective arrival counter.
//! Each generation triggers its event once the expected number of arrivals
//! has been recorded. Generations are bounded by
//! [`SubstrateConfig::max_phases`]: advancing past the last generation moves
//! to a successor barrier id. The successor is created once and shared by
//! every caller that advances the same exhausted barrier, so all shards
//! agree on it. [`BarrierSubstrate::previous_phase`] is plain arithmetic on
//! the id and therefore does *not* undo such a move.
//!
//! A generation keeps no arrival state once it has triggered; only its
//! contributions, if any, are kept. A barrier whose generations have all
//! triggered is reclaimed as soon as generation 0 of its successor has
//! triggered too, since by then every participant has moved past it.
//! Asking a reclaimed barrier for an event yields a triggered event;
//! arriving on it is an over-arrival.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::SubstrateError;
use crate::event::{Event, UserEvent};

/// One generation of a phase barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhaseBarrier {
    /// Barrier id. Zero is reserved for [`PhaseBarrier::NONE`].
    pub id: u64,
    /// Generation within the barrier.
    pub generation: u32,
}

impl PhaseBarrier {
    /// The absent barrier.
    pub const NONE: PhaseBarrier = PhaseBarrier {
        id: 0,
        generation: 0,
    };

    /// Whether this names a created barrier.
    pub fn exists(&self) -> bool {
        self.id != 0
    }
}

impl fmt::Display for PhaseBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Configuration of a [`BarrierSubstrate`].
#[derive(Clone, Debug)]
pub struct SubstrateConfig {
    /// Number of generations per barrier id. Default: 1024.
    pub max_phases: u32,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self { max_phases: 1024 }
    }
}

// ── Records ────────────────────────────────────────────────────────

#[derive(Default)]
struct Generation {
    arrived: usize,
    event: Option<UserEvent>,
    contributions: Vec<Vec<u8>>,
}

/// Generations that have triggered: everything below `below`, plus the
/// ones that triggered out of order.
#[derive(Default)]
struct Settled {
    below: u32,
    ahead: BTreeSet<u32>,
}

impl Settled {
    fn contains(&self, generation: u32) -> bool {
        generation < self.below || self.ahead.contains(&generation)
    }

    fn insert(&mut self, generation: u32) {
        if generation != self.below {
            self.ahead.insert(generation);
            return;
        }
        self.below += 1;
        while self.ahead.remove(&self.below) {
            self.below += 1;
        }
    }
}

struct BarrierRecord {
    expected: usize,
    /// Generations that have not triggered yet.
    pending: HashMap<u32, Generation>,
    /// Contributions of triggered generations that had any.
    results: HashMap<u32, Vec<Vec<u8>>>,
    settled: Settled,
    predecessor: Option<u64>,
    successor: Option<u64>,
}

impl BarrierRecord {
    fn new(expected: usize, predecessor: Option<u64>) -> Self {
        Self {
            expected,
            pending: HashMap::new(),
            results: HashMap::new(),
            settled: Settled::default(),
            predecessor,
            successor: None,
        }
    }

    /// Move a generation that has all its arrivals to the settled set.
    /// Returns its event, if anyone asked for one.
    fn settle(&mut self, generation: u32) -> Option<UserEvent> {
        let done = self.pending.remove(&generation).unwrap_or_default();
        if !done.contributions.is_empty() {
            self.results.insert(generation, done.contributions);
        }
        self.settled.insert(generation);
        done.event
    }
}

#[derive(Default)]
struct Records {
    live: HashMap<u64, BarrierRecord>,
    destroyed: HashSet<u64>,
}

enum Lookup<'a> {
    Live(&'a mut BarrierRecord),
    Reclaimed,
}

impl Records {
    fn lookup(&mut self, id: u64, next_id: u64) -> Result<Lookup<'_>, SubstrateError> {
        if !self.live.contains_key(&id) {
            if id == 0 || id >= next_id || self.destroyed.contains(&id) {
                return Err(SubstrateError::UnknownBarrier { id });
            }
            return Ok(Lookup::Reclaimed);
        }
        self.live
            .get_mut(&id)
            .map(Lookup::Live)
            .ok_or(SubstrateError::UnknownBarrier { id })
    }

    /// Whether `id` has settled every generation and its successor has
    /// settled generation 0.
    fn reclaimable(&self, id: u64, max_phases: u32) -> bool {
        let Some(record) = self.live.get(&id) else {
            return false;
        };
        if record.settled.below < max_phases {
            return false;
        }
        match record.successor {
            Some(next) => match self.live.get(&next) {
                Some(succ) => succ.settled.contains(0),
                None => !self.destroyed.contains(&next),
            },
            None => false,
        }
    }

    /// Reclaim what the settling of `generation` on `id` released.
    fn reclaim(&mut self, id: u64, generation: u32, max_phases: u32) {
        let predecessor = self.live.get(&id).and_then(|r| r.predecessor);
        let candidates = [predecessor.filter(|_| generation == 0), Some(id)];
        for candidate in candidates.into_iter().flatten() {
            if self.reclaimable(candidate, max_phases) {
                self.live.remove(&candidate);
                debug!(barrier = candidate, "barrier reclaimed");
            }
        }
    }
}

fn triggered() -> Event {
    let ev = UserEvent::new();
    ev.trigger();
    ev.event()
}

// ── BarrierSubstrate ───────────────────────────────────────────────

/// In-process barrier substrate shared by every context of a process.
pub struct BarrierSubstrate {
    max_phases: u32,
    next_id: AtomicU64,
    records: Mutex<Records>,
}

impl BarrierSubstrate {
    /// Create a substrate. `max_phases` below 2 is raised to 2.
    pub fn new(config: SubstrateConfig) -> Self {
        Self {
            max_phases: config.max_phases.max(2),
            next_id: AtomicU64::new(1),
            records: Mutex::new(Records::default()),
        }
    }

    /// Number of generations per barrier id.
    pub fn max_phases(&self) -> u32 {
        self.max_phases
    }

    /// Number of barrier ids not yet reclaimed or destroyed.
    pub fn live_barriers(&self) -> usize {
        self.records.lock().live.len()
    }

    /// Number of generations, across every live barrier, that are still
    /// waiting for arrivals or hold contributions.
    pub fn retained_generations(&self) -> usize {
        self.records
            .lock()
            .live
            .values()
            .map(|r| r.pending.len() + r.results.len())
            .sum()
    }

    fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Create a barrier expecting `arrivals` arrivals per generation.
    pub fn create_barrier(&self, arrivals: usize) -> PhaseBarrier {
        let mut records = self.records.lock();
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        records.live.insert(id, BarrierRecord::new(arrivals, None));
        debug!(barrier = id, arrivals, "barrier created");
        PhaseBarrier { id, generation: 0 }
    }

    /// Expected arrivals per generation.
    pub fn arrivals(&self, barrier: PhaseBarrier) -> Result<usize, SubstrateError> {
        self.records
            .lock()
            .live
            .get(&barrier.id)
            .map(|r| r.expected)
            .ok_or(SubstrateError::UnknownBarrier { id: barrier.id })
    }

    /// Record `count` arrivals on a generation.
    pub fn arrive(&self, barrier: PhaseBarrier, count: usize) -> Result<(), SubstrateError> {
        self.arrive_with(barrier, count, None)
    }

    /// Record `count` arrivals, optionally contributing a value to the
    /// generation's reduction.
    pub fn arrive_with(
        &self,
        barrier: PhaseBarrier,
        count: usize,
        value: Option<Vec<u8>>,
    ) -> Result<(), SubstrateError> {
        let fire = {
            let mut records = self.records.lock();
            let next_id = self.next_id();
            let Lookup::Live(record) = records.lookup(barrier.id, next_id)? else {
                return Err(SubstrateError::Overarrival {
                    id: barrier.id,
                    generation: barrier.generation,
                    expected: 0,
                });
            };
            let expected = record.expected;
            if record.settled.contains(barrier.generation) {
                return Err(SubstrateError::Overarrival {
                    id: barrier.id,
                    generation: barrier.generation,
                    expected,
                });
            }
            let generation = record.pending.entry(barrier.generation).or_default();
            if generation.arrived + count > expected {
                return Err(SubstrateError::Overarrival {
                    id: barrier.id,
                    generation: barrier.generation,
                    expected,
                });
            }
            generation.arrived += count;
            if let Some(v) = value {
                generation.contributions.push(v);
            }
            trace!(%barrier, arrived = generation.arrived, expected, "arrival");
            if generation.arrived < expected {
                return Ok(());
            }
            let fire = record.settle(barrier.generation);
            records.reclaim(barrier.id, barrier.generation, self.max_phases);
            fire
        };
        // Trigger outside the lock: continuations may re-enter the substrate.
        if let Some(ev) = fire {
            ev.trigger();
        }
        Ok(())
    }

    /// Event of a generation; triggers when all arrivals are in.
    pub fn event(&self, barrier: PhaseBarrier) -> Result<Event, SubstrateError> {
        let mut records = self.records.lock();
        let next_id = self.next_id();
        let record = match records.lookup(barrier.id, next_id)? {
            Lookup::Live(record) => record,
            Lookup::Reclaimed => return Ok(triggered()),
        };
        if record.settled.contains(barrier.generation) {
            return Ok(triggered());
        }
        if record.expected == 0 {
            record.settle(barrier.generation);
            records.reclaim(barrier.id, barrier.generation, self.max_phases);
            return Ok(triggered());
        }
        let generation = record.pending.entry(barrier.generation).or_default();
        Ok(generation.event.get_or_insert_with(UserEvent::new).event())
    }

    /// Values contributed to a generation, in arrival order.
    pub fn contributions(&self, barrier: PhaseBarrier) -> Result<Vec<Vec<u8>>, SubstrateError> {
        let mut records = self.records.lock();
        let next_id = self.next_id();
        let record = match records.lookup(barrier.id, next_id)? {
            Lookup::Live(record) => record,
            Lookup::Reclaimed => return Err(SubstrateError::Reclaimed { id: barrier.id }),
        };
        let values = match record.pending.get(&barrier.generation) {
            Some(g) => g.contributions.clone(),
            None => record
                .results
                .get(&barrier.generation)
                .cloned()
                .unwrap_or_default(),
        };
        Ok(values)
    }

    /// The generation after `barrier`.
    ///
    /// At the last generation this returns generation 0 of the successor id.
    pub fn advance(&self, barrier: PhaseBarrier) -> Result<PhaseBarrier, SubstrateError> {
        let mut records = self.records.lock();
        let next_id = self.next_id();
        let within = barrier.generation + 1 < self.max_phases;
        let record = match records.lookup(barrier.id, next_id)? {
            Lookup::Live(record) => record,
            Lookup::Reclaimed if within => {
                return Ok(PhaseBarrier {
                    id: barrier.id,
                    generation: barrier.generation + 1,
                })
            }
            Lookup::Reclaimed => return Err(SubstrateError::Reclaimed { id: barrier.id }),
        };
        if within {
            return Ok(PhaseBarrier {
                id: barrier.id,
                generation: barrier.generation + 1,
            });
        }
        let expected = record.expected;
        let successor = match record.successor {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::AcqRel);
                record.successor = Some(id);
                records
                    .live
                    .insert(id, BarrierRecord::new(expected, Some(barrier.id)));
                debug!(barrier = barrier.id, successor = id, "barrier phases exhausted");
                id
            }
        };
        Ok(PhaseBarrier {
            id: successor,
            generation: 0,
        })
    }

    /// The generation before `barrier` on the same id.
    pub fn previous_phase(&self, barrier: PhaseBarrier) -> PhaseBarrier {
        let generation = if barrier.generation == 0 {
            self.max_phases - 1
        } else {
            barrier.generation - 1
        };
        PhaseBarrier {
            id: barrier.id,
            generation,
        }
    }

    /// Destroy a barrier. Pending generations are left untriggered.
    pub fn destroy(&self, barrier: PhaseBarrier) -> Result<(), SubstrateError> {
        let mut records = self.records.lock();
        records
            .live
            .remove(&barrier.id)
            .ok_or(SubstrateError::UnknownBarrier { id: barrier.id })?;
        records.destroyed.insert(barrier.id);
        Ok(())
    }
}

impl Default for BarrierSubstrate {
    fn default() -> Self {
        Self::new(SubstrateConfig::default())
    }
}

impl fmt::Debug for BarrierSubstrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrierSubstrate")
            .field("max_phases", &self.max_phases)
            .field("barriers", &self.records.lock().live.len())
            .finish()
    }
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<BarrierSubstrate>();
};
