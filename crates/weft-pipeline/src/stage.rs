//! Pipeline stages and child-operation lifecycle states.

use std::fmt;

use crate::queue::Discipline;

/// A pipeline stage. Every stage owns one work queue.
///
/// Variants are declared in pipeline order; an operation only ever moves to
/// a stage that compares greater than or equal to its current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Issue-time bookkeeping (trace capture, unordered-op injection).
    Prepipeline,
    /// Logical dependence analysis. Runs in issue order.
    Dependence,
    /// Mapping preconditions satisfied.
    Ready,
    /// Processor selection for tasks.
    EnqueueTask,
    /// Distribution of tasks to their target node.
    DistributeTask,
    /// Task launch; the task is mapped afterwards.
    LaunchTask,
    /// Predicate resolution.
    Resolution,
    /// Execution preconditions satisfied; effects are launched.
    TriggerExecution,
    /// Effects launched; the operation is EXECUTED.
    DeferredExecution,
    /// Effects finished.
    TriggerCompletion,
    /// Completion event triggered; the operation is COMPLETED.
    DeferredCompletion,
    /// Commit preconditions satisfied.
    TriggerCommit,
    /// The operation is COMMITTED.
    DeferredCommit,
    /// Task futures are resolved.
    PostEnd,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 14] = [
        Stage::Prepipeline,
        Stage::Dependence,
        Stage::Ready,
        Stage::EnqueueTask,
        Stage::DistributeTask,
        Stage::LaunchTask,
        Stage::Resolution,
        Stage::TriggerExecution,
        Stage::DeferredExecution,
        Stage::TriggerCompletion,
        Stage::DeferredCompletion,
        Stage::TriggerCommit,
        Stage::DeferredCommit,
        Stage::PostEnd,
    ];

    /// Dense index into [`Stage::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Queue discipline of the stage.
    pub fn discipline(self) -> Discipline {
        match self {
            Stage::Prepipeline | Stage::Dependence => Discipline::InOrder,
            _ => Discipline::ReadyFirst,
        }
    }

    /// Stable name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Prepipeline => "prepipeline",
            Stage::Dependence => "dependence",
            Stage::Ready => "ready",
            Stage::EnqueueTask => "enqueue-task",
            Stage::DistributeTask => "distribute-task",
            Stage::LaunchTask => "launch-task",
            Stage::Resolution => "resolution",
            Stage::TriggerExecution => "trigger-execution",
            Stage::DeferredExecution => "deferred-execution",
            Stage::TriggerCompletion => "trigger-completion",
            Stage::DeferredCompletion => "deferred-completion",
            Stage::TriggerCommit => "trigger-commit",
            Stage::DeferredCommit => "deferred-commit",
            Stage::PostEnd => "post-end",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of an in-flight child operation, as seen by its context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildStage {
    /// Issued, effects not yet launched.
    Executing,
    /// Effects launched.
    Executed,
    /// Effects finished.
    Completed,
    /// No longer needed for recovery; may be retired.
    Committed,
}
