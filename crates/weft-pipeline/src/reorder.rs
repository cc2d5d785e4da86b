//! Reorder buffer of in-flight child operations.
//!
//! Entries are keyed by context index. Lifecycle updates may arrive in any
//! order, but [`ReorderBuffer::retire`] only removes the committed prefix,
//! so an entry never leaves before every lower-indexed entry has.

use std::collections::BTreeMap;

use weft_core::ContextIndex;

use crate::operation::OpRef;
use crate::stage::ChildStage;

/// One in-flight child operation.
#[derive(Clone, Debug)]
pub struct ReorderBufferEntry {
    /// Handle to the operation.
    pub operation: OpRef,
    /// Its context index.
    pub operation_index: ContextIndex,
    /// Its lifecycle state.
    pub stage: ChildStage,
}

/// Per-state counts of buffered entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageCounts {
    /// Entries in [`ChildStage::Executing`].
    pub executing: usize,
    /// Entries in [`ChildStage::Executed`].
    pub executed: usize,
    /// Entries in [`ChildStage::Completed`].
    pub completed: usize,
    /// Entries in [`ChildStage::Committed`] not yet retired.
    pub committed: usize,
}

/// Ordered bookkeeping of in-flight child operations.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    entries: BTreeMap<ContextIndex, ReorderBufferEntry>,
    counts: StageCounts,
    last_retired: Option<ContextIndex>,
}

impl ReorderBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly issued operation in [`ChildStage::Executing`].
    ///
    /// Indices must be strictly increasing across calls.
    pub fn insert(&mut self, operation: OpRef, index: ContextIndex) {
        debug_assert!(
            self.entries
                .keys()
                .next_back()
                .copied()
                .max(self.last_retired)
                .is_none_or(|last| last < index),
            "reorder buffer indices must increase"
        );
        self.entries.insert(
            index,
            ReorderBufferEntry {
                operation,
                operation_index: index,
                stage: ChildStage::Executing,
            },
        );
        self.counts.executing += 1;
    }

    /// Move an entry forward to `stage`. Returns `false` for unknown
    /// indices and for updates that would move the entry backwards.
    pub fn update(&mut self, index: ContextIndex, stage: ChildStage) -> bool {
        let Some(entry) = self.entries.get_mut(&index) else {
            return false;
        };
        if stage <= entry.stage {
            return false;
        }
        let old = entry.stage;
        entry.stage = stage;
        *Self::slot(&mut self.counts, old) -= 1;
        *Self::slot(&mut self.counts, stage) += 1;
        true
    }

    /// Remove and return the committed prefix, lowest index first.
    pub fn retire(&mut self) -> Vec<ReorderBufferEntry> {
        let mut out = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.get().stage != ChildStage::Committed {
                break;
            }
            let entry = entry.remove();
            self.counts.committed -= 1;
            self.last_retired = Some(entry.operation_index);
            out.push(entry);
        }
        out
    }

    /// Stage of a buffered entry.
    pub fn stage_of(&self, index: ContextIndex) -> Option<ChildStage> {
        self.entries.get(&index).map(|e| e.stage)
    }

    /// Entries below [`ChildStage::Completed`], in index order.
    pub fn incomplete(&self) -> impl Iterator<Item = &ReorderBufferEntry> {
        self.entries
            .values()
            .filter(|e| e.stage < ChildStage::Completed)
    }

    /// Per-state counts.
    pub fn counts(&self) -> StageCounts {
        self.counts
    }

    /// Highest retired index.
    pub fn last_retired(&self) -> Option<ContextIndex> {
        self.last_retired
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(counts: &mut StageCounts, stage: ChildStage) -> &mut usize {
        match stage {
            ChildStage::Executing => &mut counts.executing,
            ChildStage::Executed => &mut counts.executed,
            ChildStage::Completed => &mut counts.completed,
            ChildStage::Committed => &mut counts.committed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OpKind, OpSpec, Operation};
    use proptest::prelude::*;
    use rand_chacha::rand_core::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn op_ref(i: u64) -> OpRef {
        OpRef::new(&Operation::new(ContextIndex(i), OpSpec::new(OpKind::Fill)))
    }

    fn filled(n: u64) -> ReorderBuffer {
        let mut rob = ReorderBuffer::new();
        for i in 0..n {
            rob.insert(op_ref(i), ContextIndex(i));
        }
        rob
    }

    #[test]
    fn out_of_order_commit_waits_for_prefix() {
        let mut rob = filled(3);
        assert!(rob.update(ContextIndex(2), ChildStage::Committed));
        assert!(rob.retire().is_empty());
        rob.update(ContextIndex(0), ChildStage::Committed);
        let retired: Vec<_> = rob.retire().iter().map(|e| e.operation_index).collect();
        assert_eq!(retired, vec![ContextIndex(0)]);
        rob.update(ContextIndex(1), ChildStage::Committed);
        let retired: Vec<_> = rob.retire().iter().map(|e| e.operation_index).collect();
        assert_eq!(retired, vec![ContextIndex(1), ContextIndex(2)]);
        assert!(rob.is_empty());
        assert_eq!(rob.last_retired(), Some(ContextIndex(2)));
    }

    #[test]
    fn backwards_update_rejected() {
        let mut rob = filled(1);
        assert!(rob.update(ContextIndex(0), ChildStage::Completed));
        assert!(!rob.update(ContextIndex(0), ChildStage::Executed));
        assert!(!rob.update(ContextIndex(9), ChildStage::Completed));
        assert_eq!(
            rob.counts(),
            StageCounts {
                completed: 1,
                ..StageCounts::default()
            }
        );
    }

    #[test]
    fn incomplete_lists_pending_entries() {
        let mut rob = filled(3);
        rob.update(ContextIndex(1), ChildStage::Completed);
        let idx: Vec<_> = rob.incomplete().map(|e| e.operation_index).collect();
        assert_eq!(idx, vec![ContextIndex(0), ContextIndex(2)]);
    }

    proptest! {
        #[test]
        fn retirement_is_monotone(n in 1u64..64, seed in any::<u64>()) {
            let mut rob = filled(n);
            let mut order: Vec<u64> = (0..n).collect();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for i in (1..order.len()).rev() {
                let j = (rng.next_u64() % (i as u64 + 1)) as usize;
                order.swap(i, j);
            }
            let mut retired = Vec::new();
            for i in order {
                rob.update(ContextIndex(i), ChildStage::Committed);
                for e in rob.retire() {
                    // Nothing below it may still be buffered.
                    let below = ContextIndex(e.operation_index.0.saturating_sub(1));
                    prop_assert!(rob.stage_of(below).is_none());
                    retired.push(e.operation_index.0);
                }
            }
            prop_assert_eq!(retired, (0..n).collect::<Vec<_>>());
        }
    }
}
