//! Logical dependence analysis.
//!
//! For every region tree the tracker keeps the users since the last
//! execution fence: the operation index, privilege, fields, and the
//! operation's mapped and completion events. A new requirement depends on
//! every earlier user of the same tree whose fields overlap and whose
//! privilege conflicts with it. Users entirely covered by a later writer
//! are pruned, since anything ordered after the writer is transitively
//! ordered after them.

use std::collections::HashMap;

use weft_core::{ContextIndex, Event, FieldMask, LogicalRegion, RegionTreeId};
use weft_pipeline::{Dependences, Privilege, RegionRequirement};

use crate::resources::Resource;

#[derive(Clone, Debug)]
struct User {
    index: ContextIndex,
    region: LogicalRegion,
    privilege: Privilege,
    fields: FieldMask,
    mapped: Event,
    completed: Event,
}

/// Per-tree user lists of one context.
#[derive(Debug, Default)]
pub struct DependenceTracker {
    users: HashMap<RegionTreeId, Vec<User>>,
}

impl DependenceTracker {
    /// No users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dependences of operation `index` with `requirements`, then record it
    /// as a user.
    pub fn analyze(
        &mut self,
        index: ContextIndex,
        requirements: &[RegionRequirement],
        mapped: &Event,
        completed: &Event,
    ) -> Dependences {
        let mut mapping = Vec::new();
        let mut execution = Vec::new();
        for req in requirements {
            let users = self.users.entry(req.region.tree).or_default();
            for u in users.iter() {
                if u.index < index
                    && u.fields.overlaps(&req.fields)
                    && u.privilege.conflicts(req.privilege)
                {
                    mapping.push(u.mapped.clone());
                    execution.push(u.completed.clone());
                }
            }
            if matches!(req.privilege, Privilege::ReadWrite | Privilege::WriteDiscard) {
                users.retain(|u| !u.fields.is_subset(&req.fields));
            }
            users.push(User {
                index,
                region: req.region,
                privilege: req.privilege,
                fields: req.fields.clone(),
                mapped: mapped.clone(),
                completed: completed.clone(),
            });
        }
        Dependences {
            mapping: Event::merge(mapping),
            execution: Event::merge(execution),
        }
    }

    /// Dependences of deleting `resource`: every recorded user of it.
    pub fn analyze_deletion(&self, resource: &Resource) -> Dependences {
        let mut mapping = Vec::new();
        let mut execution = Vec::new();
        for users in self.users.values() {
            for u in users {
                if resource.touches(&u.region, &u.fields) {
                    mapping.push(u.mapped.clone());
                    execution.push(u.completed.clone());
                }
            }
        }
        Dependences {
            mapping: Event::all_settled(mapping),
            execution: Event::all_settled(execution),
        }
    }

    /// Drop every user. Called when an execution fence subsumes them.
    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Number of recorded users across all trees.
    pub fn user_count(&self) -> usize {
        self.users.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{FieldId, FieldSpaceId, IndexSpaceId, UserEvent};

    fn region(tree: u64) -> LogicalRegion {
        LogicalRegion {
            tree: RegionTreeId(tree),
            index_space: IndexSpaceId(1),
            field_space: FieldSpaceId(1),
        }
    }

    fn mask(fields: &[u32]) -> FieldMask {
        fields.iter().copied().map(FieldId).collect()
    }

    struct Op {
        mapped: UserEvent,
        completed: UserEvent,
    }

    impl Op {
        fn new() -> Self {
            Self {
                mapped: UserEvent::new(),
                completed: UserEvent::new(),
            }
        }
    }

    fn analyze(t: &mut DependenceTracker, i: u64, req: RegionRequirement, op: &Op) -> Dependences {
        t.analyze(
            ContextIndex(i),
            &[req],
            &op.mapped.event(),
            &op.completed.event(),
        )
    }

    #[test]
    fn read_after_write_depends() {
        let mut t = DependenceTracker::new();
        let w = Op::new();
        analyze(&mut t, 0, RegionRequirement::read_write(region(1), mask(&[0])), &w);
        let r = Op::new();
        let deps = analyze(&mut t, 1, RegionRequirement::read_only(region(1), mask(&[0])), &r);
        assert!(!deps.execution.has_triggered());
        w.completed.trigger();
        assert!(deps.execution.has_triggered());
    }

    #[test]
    fn readers_and_disjoint_fields_are_independent() {
        let mut t = DependenceTracker::new();
        let a = Op::new();
        analyze(&mut t, 0, RegionRequirement::read_only(region(1), mask(&[0])), &a);
        let b = Op::new();
        let deps = analyze(&mut t, 1, RegionRequirement::read_only(region(1), mask(&[0])), &b);
        assert!(deps.execution.has_triggered());
        let c = Op::new();
        let deps = analyze(&mut t, 2, RegionRequirement::read_write(region(1), mask(&[1])), &c);
        assert!(deps.execution.has_triggered());
        let d = Op::new();
        let deps = analyze(&mut t, 3, RegionRequirement::read_write(region(2), mask(&[0])), &d);
        assert!(deps.execution.has_triggered());
    }

    #[test]
    fn covering_writer_prunes_earlier_users() {
        let mut t = DependenceTracker::new();
        for i in 0..4 {
            let op = Op::new();
            analyze(&mut t, i, RegionRequirement::read_only(region(1), mask(&[0])), &op);
        }
        assert_eq!(t.user_count(), 4);
        let w = Op::new();
        analyze(&mut t, 4, RegionRequirement::read_write(region(1), mask(&[0, 1])), &w);
        assert_eq!(t.user_count(), 1);
    }

    #[test]
    fn same_reduction_operator_commutes() {
        use weft_core::ReductionOpId;
        let mut t = DependenceTracker::new();
        let redop = Privilege::Reduce(ReductionOpId(1));
        let a = Op::new();
        analyze(&mut t, 0, RegionRequirement::new(region(1), mask(&[0]), redop), &a);
        let b = Op::new();
        let deps = analyze(&mut t, 1, RegionRequirement::new(region(1), mask(&[0]), redop), &b);
        assert!(deps.execution.has_triggered());
        let c = Op::new();
        let other = Privilege::Reduce(ReductionOpId(2));
        let deps = analyze(&mut t, 2, RegionRequirement::new(region(1), mask(&[0]), other), &c);
        assert!(!deps.execution.has_triggered());
    }

    #[test]
    fn deletion_waits_for_users_of_the_field_space() {
        let mut t = DependenceTracker::new();
        let a = Op::new();
        analyze(&mut t, 0, RegionRequirement::read_write(region(1), mask(&[0])), &a);
        let deps = t.analyze_deletion(&Resource::FieldSpace(FieldSpaceId(1)));
        assert!(!deps.execution.has_triggered());
        let other = t.analyze_deletion(&Resource::FieldSpace(FieldSpaceId(9)));
        assert!(other.execution.has_triggered());
        a.completed.trigger();
        assert!(deps.execution.has_triggered());
    }
}
