//! The operation pipeline.
//!
//! [`OperationPipeline`] owns one [`WorkQueue`] per [`Stage`]. An issued
//! operation enters the prepipeline queue and is advanced stage by stage by
//! meta-tasks; each hop is gated on the event that must trigger before the
//! next stage may run. The owning context participates through the
//! [`PipelineHost`] callbacks.
//!
//! # Stage transitions
//!
//! ```text
//! prepipeline ─► dependence ─(mapping pre)─► ready
//!   ready ─► [enqueue ─► distribute ─► launch]   (tasks only)
//!   ─(predicate)─► resolution ─(execution pre)─► trigger-execution
//!   ─► deferred-execution ─(effects)─► trigger-completion
//!   ─(completion)─► deferred-completion ─► trigger-commit
//!   ─(commit)─► deferred-commit ─► post-end
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};
use weft_core::{Event, Poisoned};

use crate::operation::Operation;
use crate::queue::{Drained, WorkQueue};
use crate::sched::Scheduler;
use crate::stage::{ChildStage, Stage};

/// Preconditions computed by logical dependence analysis.
#[derive(Clone, Debug, Default)]
pub struct Dependences {
    /// Must trigger before the operation maps.
    pub mapping: Event,
    /// Must trigger before the operation's effects run.
    pub execution: Event,
}

/// Context-side callbacks invoked as operations advance.
///
/// Callbacks run on meta-task threads with no pipeline lock held.
pub trait PipelineHost: Send + Sync {
    /// Issue-time bookkeeping, in issue order.
    fn prepipeline(&self, _op: &Arc<Operation>) {}

    /// Logical dependence analysis, in issue order.
    fn analyze_dependences(&self, op: &Arc<Operation>) -> Dependences;

    /// The operation has mapped.
    fn on_mapped(&self, _op: &Arc<Operation>) {}

    /// The operation's effects were launched.
    fn on_executed(&self, op: &Arc<Operation>);

    /// The operation's effects finished.
    fn on_completed(&self, op: &Arc<Operation>);

    /// The operation committed.
    fn on_committed(&self, op: &Arc<Operation>);

    /// The operation's future was resolved; the pipeline is done with it.
    fn on_post_end(&self, _op: &Arc<Operation>) {}
}

struct PipelineInner {
    queues: Vec<Arc<WorkQueue<Arc<Operation>>>>,
    host: Weak<dyn PipelineHost>,
    scheduler: Arc<dyn Scheduler>,
}

/// Stage-by-stage driver of a context's operations.
#[derive(Clone)]
pub struct OperationPipeline {
    inner: Arc<PipelineInner>,
}

impl OperationPipeline {
    /// Create a pipeline reporting to `host` and running meta-tasks on
    /// `scheduler`.
    pub fn new(host: Weak<dyn PipelineHost>, scheduler: Arc<dyn Scheduler>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PipelineInner>| {
            let queues = Stage::ALL
                .iter()
                .map(|&stage| {
                    let weak = weak.clone();
                    WorkQueue::new(
                        stage.name(),
                        stage.discipline(),
                        Box::new(move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.schedule(stage);
                            }
                        }),
                    )
                })
                .collect();
            PipelineInner {
                queues,
                host,
                scheduler,
            }
        });
        Self { inner }
    }

    /// Hand a freshly issued operation to the pipeline. Never blocks.
    pub fn issue(&self, op: Arc<Operation>) {
        debug!(op = %op.index(), kind = %op.kind(), "issued");
        self.inner.enqueue(Stage::Prepipeline, op, Event::NO_EVENT);
    }

    /// Drain `stage` on the calling thread until nothing in it is ready.
    ///
    /// Returns whether unready entries remain queued in the stage.
    pub fn process(&self, stage: Stage) -> bool {
        self.inner.process(stage)
    }

    /// Number of operations queued in `stage`.
    pub fn queued(&self, stage: Stage) -> usize {
        self.inner.queues[stage.index()].len()
    }

    /// Number of operations queued in any stage.
    pub fn in_flight(&self) -> usize {
        self.inner.queues.iter().map(|q| q.len()).sum()
    }
}

impl PipelineInner {
    fn queue(&self, stage: Stage) -> &Arc<WorkQueue<Arc<Operation>>> {
        &self.queues[stage.index()]
    }

    fn schedule(self: Arc<Self>, stage: Stage) {
        let inner = Arc::clone(&self);
        self.scheduler.spawn(Box::new(move || {
            inner.process(stage);
        }));
    }

    fn enqueue(&self, stage: Stage, op: Arc<Operation>, ready: Event) {
        op.set_stage(stage);
        trace!(op = %op.index(), stage = %stage, "queued");
        self.queue(stage).add(op, ready);
    }

    fn process(&self, stage: Stage) -> bool {
        loop {
            let Drained { items, more } = self.queue(stage).drain();
            if items.is_empty() {
                return more;
            }
            let Some(host) = self.host.upgrade() else {
                warn!(stage = %stage, dropped = items.len(), "context gone; dropping operations");
                continue;
            };
            for op in items {
                self.advance(stage, op, host.as_ref());
            }
        }
    }

    fn advance(&self, stage: Stage, op: Arc<Operation>, host: &dyn PipelineHost) {
        match stage {
            Stage::Prepipeline => {
                host.prepipeline(&op);
                self.enqueue(Stage::Dependence, op, Event::NO_EVENT);
            }
            Stage::Dependence => {
                let deps = host.analyze_dependences(&op);
                op.set_preconditions(deps.mapping.clone(), deps.execution);
                self.enqueue(Stage::Ready, op, deps.mapping);
            }
            Stage::Ready => {
                if op.kind().is_task() {
                    self.enqueue(Stage::EnqueueTask, op, Event::NO_EVENT);
                } else {
                    self.mapped(op, host);
                }
            }
            Stage::EnqueueTask => {
                let processor = op.behavior().select_processor(&op);
                op.set_processor(processor);
                self.enqueue(Stage::DistributeTask, op, Event::NO_EVENT);
            }
            Stage::DistributeTask => {
                if !op.behavior().distribute(&op) {
                    trace!(op = %op.index(), "distribution declined; running locally");
                }
                self.enqueue(Stage::LaunchTask, op, Event::NO_EVENT);
            }
            Stage::LaunchTask => {
                op.behavior().launch(&op);
                self.mapped(op, host);
            }
            Stage::Resolution => {
                match op.predicate().and_then(|p| p.try_value()) {
                    Some(Err(Poisoned)) => {
                        debug!(op = %op.index(), "predicate poisoned");
                        op.set_poisoned();
                    }
                    Some(Ok(false)) => {
                        debug!(op = %op.index(), "predicate false; effects skipped");
                        op.set_predicated_false();
                    }
                    Some(Ok(true)) | None => {}
                }
                let pre = op.execution_precondition();
                self.enqueue(Stage::TriggerExecution, op, pre);
            }
            Stage::TriggerExecution => {
                if op.is_poisoned() || op.execution_precondition().is_poisoned() {
                    debug!(op = %op.index(), "execution skipped; poisoned");
                    op.set_poisoned();
                    op.set_effects(Event::NO_EVENT, None);
                } else if op.predicated_false() {
                    op.set_effects(Event::NO_EVENT, Some(op.false_value()));
                } else {
                    let exec = op.behavior().execute(&op);
                    op.set_effects(exec.effects, exec.value);
                }
                self.enqueue(Stage::DeferredExecution, op, Event::NO_EVENT);
            }
            Stage::DeferredExecution => {
                op.set_child_stage(ChildStage::Executed);
                host.on_executed(&op);
                let effects = op.effects();
                self.enqueue(Stage::TriggerCompletion, op, effects);
            }
            Stage::TriggerCompletion => {
                if op.effects().is_poisoned() {
                    op.set_poisoned();
                }
                op.trigger_completion(op.is_poisoned());
                let completion = op.completion_event();
                self.enqueue(Stage::DeferredCompletion, op, completion);
            }
            Stage::DeferredCompletion => {
                op.set_child_stage(ChildStage::Completed);
                host.on_completed(&op);
                self.enqueue(Stage::TriggerCommit, op, Event::NO_EVENT);
            }
            Stage::TriggerCommit => {
                op.trigger_commit();
                let commit = op.commit_event();
                self.enqueue(Stage::DeferredCommit, op, commit);
            }
            Stage::DeferredCommit => {
                op.set_child_stage(ChildStage::Committed);
                host.on_committed(&op);
                self.enqueue(Stage::PostEnd, op, Event::NO_EVENT);
            }
            Stage::PostEnd => {
                let result = op.result();
                if op.is_poisoned() {
                    result.poison();
                } else {
                    result.set(op.take_value().unwrap_or_default());
                }
                debug!(op = %op.index(), poisoned = op.is_poisoned(), "retired from pipeline");
                host.on_post_end(&op);
            }
        }
    }

    fn mapped(&self, op: Arc<Operation>, host: &dyn PipelineHost) {
        op.trigger_mapped();
        host.on_mapped(&op);
        let ready = op
            .predicate()
            .map(|p| p.ready_event())
            .unwrap_or(Event::NO_EVENT);
        self.enqueue(Stage::Resolution, op, ready);
    }
}

impl fmt::Debug for OperationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("OperationPipeline");
        for (stage, q) in Stage::ALL.iter().zip(&self.inner.queues) {
            d.field(stage.name(), &q.len());
        }
        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::{Future, Predicate};
    use crate::operation::{Execution, FnBehavior, OpKind, OpSpec};
    use crate::sched::ManualScheduler;
    use parking_lot::Mutex;
    use weft_core::{ContextIndex, UserEvent};

    #[derive(Default)]
    struct Recorder {
        gate: Mutex<Option<Event>>,
        log: Mutex<Vec<(u64, &'static str)>>,
    }

    impl Recorder {
        fn push(&self, op: &Operation, what: &'static str) {
            self.log.lock().push((op.index().0, what));
        }

        fn events_of(&self, index: u64) -> Vec<&'static str> {
            self.log
                .lock()
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, w)| *w)
                .collect()
        }
    }

    impl PipelineHost for Recorder {
        fn analyze_dependences(&self, _op: &Arc<Operation>) -> Dependences {
            let gate = self.gate.lock().clone().unwrap_or_default();
            Dependences {
                mapping: Event::NO_EVENT,
                execution: gate,
            }
        }
        fn on_mapped(&self, op: &Arc<Operation>) {
            self.push(op, "mapped");
        }
        fn on_executed(&self, op: &Arc<Operation>) {
            self.push(op, "executed");
        }
        fn on_completed(&self, op: &Arc<Operation>) {
            self.push(op, "completed");
        }
        fn on_committed(&self, op: &Arc<Operation>) {
            self.push(op, "committed");
        }
        fn on_post_end(&self, op: &Arc<Operation>) {
            self.push(op, "post-end");
        }
    }

    fn setup() -> (Arc<Recorder>, Arc<ManualScheduler>, OperationPipeline) {
        let host = Arc::new(Recorder::default());
        let sched = Arc::new(ManualScheduler::new());
        let weak = Arc::downgrade(&host);
        let weak: Weak<dyn PipelineHost> = weak;
        let pipe = OperationPipeline::new(weak, sched.clone());
        (host, sched, pipe)
    }

    #[test]
    fn fill_walks_every_stage() {
        let (host, sched, pipe) = setup();
        let op = Operation::new(ContextIndex(0), OpSpec::new(OpKind::Fill));
        pipe.issue(Arc::clone(&op));
        sched.run_until_idle();
        assert_eq!(
            host.events_of(0),
            vec!["mapped", "executed", "completed", "committed", "post-end"]
        );
        assert_eq!(op.stage(), Stage::PostEnd);
        assert_eq!(op.child_stage(), ChildStage::Committed);
        assert_eq!(op.result().try_get(), Some(Ok(Vec::new())));
        assert_eq!(pipe.in_flight(), 0);
    }

    #[test]
    fn task_returns_value_through_future() {
        let (_, sched, pipe) = setup();
        let spec = OpSpec::new(OpKind::Task).with_behavior(Arc::new(FnBehavior(|_: &Operation| {
            Execution::value(vec![4, 2])
        })));
        let op = Operation::new(ContextIndex(0), spec);
        let fut: Future = op.result();
        pipe.issue(op);
        sched.run_until_idle();
        assert_eq!(fut.try_get(), Some(Ok(vec![4, 2])));
    }

    #[test]
    fn effects_gate_completion() {
        let (host, sched, pipe) = setup();
        let effects = UserEvent::new();
        let e = effects.event();
        let spec = OpSpec::new(OpKind::Copy).with_behavior(Arc::new(FnBehavior(
            move |_: &Operation| Execution {
                effects: e.clone(),
                value: None,
            },
        )));
        pipe.issue(Operation::new(ContextIndex(0), spec));
        sched.run_until_idle();
        assert_eq!(host.events_of(0), vec!["mapped", "executed"]);
        assert_eq!(pipe.queued(Stage::TriggerCompletion), 1);
        effects.trigger();
        sched.run_until_idle();
        assert_eq!(host.events_of(0).last(), Some(&"post-end"));
    }

    #[test]
    fn poisoned_precondition_skips_execute() {
        let (host, sched, pipe) = setup();
        *host.gate.lock() = Some(Event::poisoned());
        let spec = OpSpec::new(OpKind::Task).with_behavior(Arc::new(FnBehavior(
            |_: &Operation| -> Execution { panic!("poisoned op must not execute") },
        )));
        let op = Operation::new(ContextIndex(0), spec);
        pipe.issue(Arc::clone(&op));
        sched.run_until_idle();
        assert!(op.is_poisoned());
        assert!(op.completion_event().is_poisoned());
        assert_eq!(op.result().try_get(), Some(Err(weft_core::Poisoned)));
        assert_eq!(host.events_of(0).last(), Some(&"post-end"));
    }

    #[test]
    fn false_predicate_delivers_false_value() {
        let (_, sched, pipe) = setup();
        let spec = OpSpec::new(OpKind::Task)
            .with_behavior(Arc::new(FnBehavior(|_: &Operation| -> Execution {
                panic!("predicated-false op must not execute")
            })))
            .with_predicate(Predicate::never(), vec![7]);
        let op = Operation::new(ContextIndex(0), spec);
        pipe.issue(Arc::clone(&op));
        sched.run_until_idle();
        assert!(op.predicated_false());
        assert!(!op.is_poisoned());
        assert_eq!(op.result().try_get(), Some(Ok(vec![7])));
    }

    #[test]
    fn poisoned_predicate_poisons_the_operation() {
        let (host, sched, pipe) = setup();
        let src = Future::pending();
        let spec = OpSpec::new(OpKind::Task)
            .with_behavior(Arc::new(FnBehavior(|_: &Operation| -> Execution {
                panic!("op with a poisoned predicate must not execute")
            })))
            .with_predicate(Predicate::from_future(src.clone()), vec![7]);
        let op = Operation::new(ContextIndex(0), spec);
        pipe.issue(Arc::clone(&op));
        src.poison();
        sched.run_until_idle();
        assert!(op.is_poisoned());
        assert!(!op.predicated_false());
        assert!(op.completion_event().is_poisoned());
        assert_eq!(op.result().try_get(), Some(Err(weft_core::Poisoned)));
        assert_eq!(host.events_of(0).last(), Some(&"post-end"));
    }

    #[test]
    fn pending_predicate_holds_resolution() {
        let (_, sched, pipe) = setup();
        let src = Future::pending();
        let spec = OpSpec::new(OpKind::Fill)
            .with_predicate(Predicate::from_future(src.clone()), Vec::new());
        pipe.issue(Operation::new(ContextIndex(0), spec));
        sched.run_until_idle();
        assert_eq!(pipe.queued(Stage::Resolution), 1);
        src.set(vec![1]);
        sched.run_until_idle();
        assert_eq!(pipe.in_flight(), 0);
    }

    #[test]
    fn dropped_host_drops_work() {
        let (host, sched, pipe) = setup();
        drop(host);
        pipe.issue(Operation::new(ContextIndex(0), OpSpec::new(OpKind::Fill)));
        sched.run_until_idle();
        assert_eq!(pipe.in_flight(), 0);
    }
}
