//! Trace capture and replay.
//!
//! Between `begin_trace` and `end_trace` the context records the signature
//! of every issued operation. At `end_trace` the recorded sequence is
//! matched against the templates already captured for the trace: a match
//! is a replay, anything else captures a new template. Each trace keeps at
//! most `max_templates_per_trace` templates; the oldest is evicted first.

use std::collections::{HashMap, VecDeque};

use tracing::debug;
use weft_core::{ContextError, TraceId};
use weft_pipeline::{OpKind, RegionRequirement};

use crate::hash::{op_signature, sequence_hash};

/// What `end_trace` did with the recorded sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOutcome {
    /// A new template was captured.
    Captured {
        /// Template number.
        template: u64,
        /// Template evicted to make room, if any.
        evicted: Option<u64>,
    },
    /// The sequence matched an existing template.
    Replayed {
        /// Template number.
        template: u64,
    },
}

impl TraceOutcome {
    /// Template the outcome refers to.
    pub fn template(&self) -> u64 {
        match self {
            Self::Captured { template, .. } | Self::Replayed { template } => *template,
        }
    }
}

#[derive(Debug)]
struct Template {
    id: u64,
    fingerprint: u64,
    ops: Vec<u64>,
}

#[derive(Debug)]
struct Recording {
    trace: TraceId,
    ops: Vec<u64>,
}

/// Templates of every trace of one context.
#[derive(Debug)]
pub struct TraceCache {
    max_templates: usize,
    next_template: u64,
    active: Option<Recording>,
    templates: HashMap<TraceId, VecDeque<Template>>,
}

impl TraceCache {
    /// Cache keeping at most `max_templates` templates per trace.
    pub fn new(max_templates: usize) -> Self {
        Self {
            max_templates: max_templates.max(1),
            next_template: 0,
            active: None,
            templates: HashMap::new(),
        }
    }

    /// Start recording `trace`. Traces do not nest.
    pub fn begin(&mut self, trace: TraceId) -> Result<(), ContextError> {
        if let Some(active) = &self.active {
            return Err(ContextError::IllegalCall {
                call: "begin_trace",
                reason: format!("trace {} is still being recorded", active.trace),
            });
        }
        self.active = Some(Recording {
            trace,
            ops: Vec::new(),
        });
        Ok(())
    }

    /// Record an issued operation if a trace is active.
    pub fn record(&mut self, kind: OpKind, requirements: &[RegionRequirement]) {
        if let Some(active) = &mut self.active {
            active.ops.push(op_signature(kind, requirements));
        }
    }

    /// Stop recording `trace` and capture or replay its template.
    pub fn end(&mut self, trace: TraceId) -> Result<TraceOutcome, ContextError> {
        let recording = match self.active.take() {
            Some(r) if r.trace == trace => r,
            Some(r) => {
                let reason = format!("trace {} is active, not {trace}", r.trace);
                self.active = Some(r);
                return Err(ContextError::IllegalCall {
                    call: "end_trace",
                    reason,
                });
            }
            None => {
                return Err(ContextError::IllegalCall {
                    call: "end_trace",
                    reason: format!("trace {trace} was never begun"),
                })
            }
        };
        let templates = self.templates.entry(trace).or_default();
        if let Some(t) = templates.iter().find(|t| t.ops == recording.ops) {
            debug!(trace = %trace, template = t.id, "trace replayed");
            return Ok(TraceOutcome::Replayed { template: t.id });
        }
        let id = self.next_template;
        self.next_template += 1;
        let evicted = if templates.len() == self.max_templates {
            templates.pop_front().map(|t| t.id)
        } else {
            None
        };
        templates.push_back(Template {
            id,
            fingerprint: sequence_hash(&recording.ops),
            ops: recording.ops,
        });
        debug!(trace = %trace, template = id, ?evicted, "trace template captured");
        Ok(TraceOutcome::Captured {
            template: id,
            evicted,
        })
    }

    /// Trace being recorded.
    pub fn active(&self) -> Option<TraceId> {
        self.active.as_ref().map(|r| r.trace)
    }

    /// Number of templates kept for `trace`.
    pub fn template_count(&self, trace: TraceId) -> usize {
        self.templates.get(&trace).map_or(0, VecDeque::len)
    }

    /// Fingerprint of a kept template.
    pub fn fingerprint(&self, template: u64) -> Option<u64> {
        self.templates
            .values()
            .flat_map(|ts| ts.iter())
            .find(|t| t.id == template)
            .map(|t| t.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(cache: &mut TraceCache, trace: u64, kinds: &[OpKind]) -> TraceOutcome {
        cache.begin(TraceId(trace)).unwrap();
        for k in kinds {
            cache.record(*k, &[]);
        }
        cache.end(TraceId(trace)).unwrap()
    }

    #[test]
    fn identical_sequence_replays() {
        let mut c = TraceCache::new(4);
        let first = run(&mut c, 1, &[OpKind::Fill, OpKind::Copy]);
        assert!(matches!(first, TraceOutcome::Captured { evicted: None, .. }));
        let second = run(&mut c, 1, &[OpKind::Fill, OpKind::Copy]);
        assert_eq!(second, TraceOutcome::Replayed { template: first.template() });
        assert_eq!(c.template_count(TraceId(1)), 1);
    }

    #[test]
    fn oldest_template_evicted_at_cap() {
        let mut c = TraceCache::new(2);
        let a = run(&mut c, 1, &[OpKind::Fill]);
        run(&mut c, 1, &[OpKind::Copy]);
        let third = run(&mut c, 1, &[OpKind::Task]);
        assert_eq!(
            third,
            TraceOutcome::Captured {
                template: 2,
                evicted: Some(a.template())
            }
        );
        assert_eq!(c.template_count(TraceId(1)), 2);
        assert!(c.fingerprint(a.template()).is_none());
        // The evicted sequence is captured again rather than replayed.
        assert!(matches!(
            run(&mut c, 1, &[OpKind::Fill]),
            TraceOutcome::Captured { .. }
        ));
    }

    #[test]
    fn nesting_and_mismatched_end_rejected() {
        let mut c = TraceCache::new(2);
        c.begin(TraceId(1)).unwrap();
        assert!(c.begin(TraceId(2)).is_err());
        assert!(c.end(TraceId(2)).is_err());
        assert_eq!(c.active(), Some(TraceId(1)));
        assert!(c.end(TraceId(1)).is_ok());
        assert!(c.end(TraceId(1)).is_err());
    }
}
