//! Fence bookkeeping.
//!
//! The context remembers the most recent mapping fence and the most recent
//! execution fence. Every operation issued after a fence picks up the
//! fence's events as preconditions; the fence itself waits on every earlier
//! operation that has not yet mapped (mapping fence) or completed
//! (execution fence).

use weft_core::{ContextIndex, Event};
use weft_pipeline::{Dependences, FenceKind};

/// A fence in scope.
#[derive(Clone, Debug)]
pub struct FenceRecord {
    /// Index of the fence operation.
    pub index: ContextIndex,
    /// Triggers once the fence has mapped.
    pub mapped: Event,
    /// Triggers once the fence has completed.
    pub completed: Event,
}

/// The fences currently in scope of a context.
#[derive(Debug, Default)]
pub struct FenceState {
    mapping: Option<FenceRecord>,
    execution: Option<FenceRecord>,
}

impl FenceState {
    /// No fences.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preconditions the fences in scope impose on operation `index`.
    ///
    /// A mapping fence delays mapping; an execution fence delays both
    /// mapping and execution. Fences issued at or after `index` are ignored.
    pub fn perform_fence_analysis(&self, index: ContextIndex) -> Dependences {
        let mut mapping = Vec::new();
        let mut execution = Vec::new();
        if let Some(f) = self.mapping.as_ref().filter(|f| f.index < index) {
            mapping.push(f.mapped.clone());
        }
        if let Some(f) = self.execution.as_ref().filter(|f| f.index < index) {
            mapping.push(f.mapped.clone());
            execution.push(f.completed.clone());
        }
        Dependences {
            mapping: Event::merge(mapping),
            execution: Event::merge(execution),
        }
    }

    /// Make `record` the current fence of its kind.
    ///
    /// An execution fence also subsumes the mapping fence, since it orders
    /// mapping as well.
    pub fn update_current_fence(&mut self, kind: FenceKind, record: FenceRecord) {
        match kind {
            FenceKind::Mapping => self.mapping = Some(record),
            FenceKind::Execution => {
                self.mapping = None;
                self.execution = Some(record);
            }
        }
    }

    /// Index of the current fence of `kind`.
    pub fn current(&self, kind: FenceKind) -> Option<ContextIndex> {
        match kind {
            FenceKind::Mapping => self.mapping.as_ref().map(|f| f.index),
            FenceKind::Execution => self.execution.as_ref().map(|f| f.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::UserEvent;

    fn record(index: u64) -> (FenceRecord, UserEvent, UserEvent) {
        let mapped = UserEvent::new();
        let completed = UserEvent::new();
        (
            FenceRecord {
                index: ContextIndex(index),
                mapped: mapped.event(),
                completed: completed.event(),
            },
            mapped,
            completed,
        )
    }

    #[test]
    fn no_fence_no_preconditions() {
        let deps = FenceState::new().perform_fence_analysis(ContextIndex(3));
        assert!(deps.mapping.has_triggered());
        assert!(deps.execution.has_triggered());
    }

    #[test]
    fn execution_fence_gates_later_ops_only() {
        let mut fs = FenceState::new();
        let (r, mapped, completed) = record(5);
        fs.update_current_fence(FenceKind::Execution, r);
        let earlier = fs.perform_fence_analysis(ContextIndex(5));
        assert!(earlier.execution.has_triggered());
        let later = fs.perform_fence_analysis(ContextIndex(6));
        assert!(!later.mapping.has_triggered());
        assert!(!later.execution.has_triggered());
        mapped.trigger();
        completed.trigger();
        assert!(later.mapping.has_triggered());
        assert!(later.execution.has_triggered());
    }

    #[test]
    fn mapping_fence_only_gates_mapping() {
        let mut fs = FenceState::new();
        let (r, _mapped, _completed) = record(1);
        fs.update_current_fence(FenceKind::Mapping, r);
        let deps = fs.perform_fence_analysis(ContextIndex(2));
        assert!(!deps.mapping.has_triggered());
        assert!(deps.execution.has_triggered());
        assert_eq!(fs.current(FenceKind::Mapping), Some(ContextIndex(1)));
        assert_eq!(fs.current(FenceKind::Execution), None);
    }
}
