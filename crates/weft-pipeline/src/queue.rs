//! Event-gated work queue.
//!
//! [`WorkQueue`] buffers payloads, each paired with a readiness [`Event`].
//! A payload becomes drainable when its event triggers. Readiness is
//! tracked in a completion set populated by event continuations, so a drain
//! never polls every entry. When work becomes drainable and no drain is
//! already scheduled, the queue calls its wake hook exactly once; the hook
//! is expected to schedule a meta-task that calls [`WorkQueue::drain`].
//!
//! # Disciplines
//!
//! - [`Discipline::ReadyFirst`] drains every ready entry in enqueue order.
//! - [`Discipline::InOrder`] drains the longest ready prefix of the queue,
//!   so an unready head blocks everything behind it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;
use weft_core::Event;

/// Hook called when drainable work appears.
pub type WakeFn = Box<dyn Fn() + Send + Sync + 'static>;

/// Order in which ready entries leave the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// Only the ready prefix drains.
    InOrder,
    /// Every ready entry drains, oldest first.
    ReadyFirst,
}

struct QueueEntry<T> {
    payload: T,
    ready: Event,
}

struct QueueState<T> {
    entries: BTreeMap<u64, QueueEntry<T>>,
    ready: BTreeSet<u64>,
    next_seq: u64,
    scheduled: bool,
}

impl<T> QueueState<T> {
    fn drainable(&self, discipline: Discipline) -> bool {
        match discipline {
            Discipline::ReadyFirst => !self.ready.is_empty(),
            Discipline::InOrder => match self.entries.keys().next() {
                Some(head) => self.ready.contains(head),
                None => false,
            },
        }
    }
}

/// Drain result.
#[derive(Debug)]
pub struct Drained<T> {
    /// Payloads whose readiness event triggered, in enqueue order.
    pub items: Vec<T>,
    /// Whether entries remain in the queue.
    pub more: bool,
}

/// Event-gated queue shared between producers and the draining meta-task.
pub struct WorkQueue<T> {
    name: &'static str,
    discipline: Discipline,
    state: Mutex<QueueState<T>>,
    wake: WakeFn,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create a queue.
    pub fn new(name: &'static str, discipline: Discipline, wake: WakeFn) -> Arc<Self> {
        Arc::new(Self {
            name,
            discipline,
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                ready: BTreeSet::new(),
                next_seq: 0,
                scheduled: false,
            }),
            wake,
        })
    }

    /// Queue name, used in log output.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `payload`, drainable once `ready` triggers. Never blocks.
    pub fn add(self: &Arc<Self>, payload: T, ready: Event) {
        let seq = {
            let mut st = self.state.lock();
            let seq = st.next_seq;
            st.next_seq += 1;
            st.entries.insert(
                seq,
                QueueEntry {
                    payload,
                    ready: ready.clone(),
                },
            );
            seq
        };
        trace!(queue = self.name, seq, "enqueued");
        let weak: Weak<Self> = Arc::downgrade(self);
        ready.subscribe(move |_| {
            if let Some(queue) = weak.upgrade() {
                queue.mark_ready(seq);
            }
        });
    }

    fn mark_ready(&self, seq: u64) {
        let wake = {
            let mut st = self.state.lock();
            if !st.entries.contains_key(&seq) {
                return;
            }
            st.ready.insert(seq);
            if !st.scheduled && st.drainable(self.discipline) {
                st.scheduled = true;
                true
            } else {
                false
            }
        };
        if wake {
            (self.wake)();
        }
    }

    /// Pop every drainable entry.
    ///
    /// The scheduled flag is only cleared by a drain that finds nothing, so
    /// the draining meta-task keeps calling `drain` until it comes back
    /// empty. This keeps at most one drainer per queue.
    pub fn drain(&self) -> Drained<T> {
        let mut st = self.state.lock();
        let seqs: Vec<u64> = match self.discipline {
            Discipline::ReadyFirst => st.ready.iter().copied().collect(),
            Discipline::InOrder => st
                .entries
                .keys()
                .copied()
                .take_while(|seq| st.ready.contains(seq))
                .collect(),
        };
        let mut items = Vec::with_capacity(seqs.len());
        for seq in seqs {
            st.ready.remove(&seq);
            if let Some(entry) = st.entries.remove(&seq) {
                debug_assert!(entry.ready.has_triggered());
                items.push(entry.payload);
            }
        }
        if items.is_empty() {
            st.scheduled = false;
        }
        let more = !st.entries.is_empty();
        trace!(queue = self.name, drained = items.len(), more, "drained");
        Drained { items, more }
    }

    /// Number of buffered entries, ready or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries whose readiness event has triggered.
    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("discipline", &self.discipline)
            .field("entries", &st.entries.len())
            .field("ready", &st.ready.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_core::UserEvent;

    fn counting(discipline: Discipline) -> (Arc<WorkQueue<u32>>, Arc<AtomicUsize>) {
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&wakes);
        let q = WorkQueue::new(
            "test",
            discipline,
            Box::new(move || {
                w.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (q, wakes)
    }

    #[test]
    fn triggered_entries_wake_once() {
        let (q, wakes) = counting(Discipline::ReadyFirst);
        q.add(1, Event::NO_EVENT);
        q.add(2, Event::NO_EVENT);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        let d = q.drain();
        assert_eq!(d.items, vec![1, 2]);
        assert!(!d.more);
        // Still scheduled until a drain comes back empty.
        q.add(3, Event::NO_EVENT);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert_eq!(q.drain().items, vec![3]);
        assert!(q.drain().items.is_empty());
        q.add(4, Event::NO_EVENT);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ready_first_skips_blocked_entries() {
        let (q, _) = counting(Discipline::ReadyFirst);
        let gate = UserEvent::new();
        q.add(1, gate.event());
        q.add(2, Event::NO_EVENT);
        let d = q.drain();
        assert_eq!(d.items, vec![2]);
        assert!(d.more);
        gate.trigger();
        assert_eq!(q.drain().items, vec![1]);
    }

    #[test]
    fn in_order_blocks_behind_head() {
        let (q, wakes) = counting(Discipline::InOrder);
        let gate = UserEvent::new();
        q.add(1, gate.event());
        q.add(2, Event::NO_EVENT);
        assert_eq!(wakes.load(Ordering::SeqCst), 0);
        assert!(q.drain().items.is_empty());
        gate.trigger();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert_eq!(q.drain().items, vec![1, 2]);
    }

    #[test]
    fn poisoned_readiness_still_drains() {
        let (q, _) = counting(Discipline::ReadyFirst);
        let gate = UserEvent::new();
        q.add(7, gate.event());
        gate.poison();
        assert_eq!(q.drain().items, vec![7]);
    }
}
