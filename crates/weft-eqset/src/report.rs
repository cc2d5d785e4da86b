//! Accumulation of remote equivalence-set reports.
//!
//! A query that reaches subtrees owned by other nodes opens a pending
//! request naming every distinct owner. Owners answer with report
//! messages; partial results accumulate until each owner has replied once,
//! at which point the request's readiness event triggers.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::trace;
use weft_core::{Event, NodeId, UserEvent};

use crate::error::EqSetError;
use crate::set::{merge_by_did, SetOverlap};

struct PendingRequest {
    expected: BTreeSet<NodeId>,
    replied: BTreeSet<NodeId>,
    sets: Vec<SetOverlap>,
    ready: UserEvent,
}

/// Pending remote requests of one node.
#[derive(Default)]
pub struct ReportCollector {
    next: Mutex<u64>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl ReportCollector {
    /// No pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request answered by `owners`. Returns its number and the
    /// event triggered once every owner has replied.
    pub fn open<I>(&self, owners: I) -> (u64, Event)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let expected: BTreeSet<NodeId> = owners.into_iter().collect();
        let ready = UserEvent::new();
        let event = ready.event();
        if expected.is_empty() {
            ready.trigger();
        }
        let id = {
            let mut next = self.next.lock();
            *next += 1;
            *next
        };
        self.pending.lock().insert(
            id,
            PendingRequest {
                expected,
                replied: BTreeSet::new(),
                sets: Vec::new(),
                ready,
            },
        );
        (id, event)
    }

    /// Record `from`'s reply. Returns `true` when it was the last one.
    pub fn report(
        &self,
        request: u64,
        from: NodeId,
        sets: Vec<SetOverlap>,
    ) -> Result<bool, EqSetError> {
        let fire = {
            let mut pending = self.pending.lock();
            let req = pending
                .get_mut(&request)
                .ok_or(EqSetError::UnknownRequest { request })?;
            if !req.expected.contains(&from) {
                return Err(EqSetError::UnexpectedResponder {
                    request,
                    node: from,
                });
            }
            req.sets.extend(sets);
            req.replied.insert(from);
            trace!(
                request,
                %from,
                replied = req.replied.len(),
                expected = req.expected.len(),
                "report"
            );
            (req.replied == req.expected).then(|| req.ready.clone())
        };
        match fire {
            Some(ev) => {
                ev.trigger();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a completed request and return its sets, merged by id.
    ///
    /// Returns `None` while replies are outstanding.
    pub fn take(&self, request: u64) -> Result<Option<Vec<SetOverlap>>, EqSetError> {
        let mut pending = self.pending.lock();
        let req = pending
            .get(&request)
            .ok_or(EqSetError::UnknownRequest { request })?;
        if req.replied != req.expected {
            return Ok(None);
        }
        let req = pending
            .remove(&request)
            .ok_or(EqSetError::UnknownRequest { request })?;
        Ok(Some(merge_by_did(req.sets)))
    }

    /// Number of open requests.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rect::Rect;
    use crate::set::EquivalenceSet;
    use std::sync::Arc;
    use weft_core::{DistributedId, FieldId, FieldMask};

    fn overlap(did: u64, owner: u32, field: u32) -> SetOverlap {
        SetOverlap {
            set: Arc::new(EquivalenceSet::new(
                DistributedId(did),
                NodeId(owner),
                Rect::line(0, 9),
            )),
            mask: [FieldId(field)].into_iter().collect::<FieldMask>(),
        }
    }

    #[test]
    fn triggers_after_every_owner_replies() {
        let c = ReportCollector::new();
        let (id, ready) = c.open([NodeId(1), NodeId(2), NodeId(1)]);
        assert_eq!(c.report(id, NodeId(1), vec![overlap(5, 1, 0)]), Ok(false));
        assert!(!ready.has_triggered());
        assert_eq!(c.take(id), Ok(None));
        assert_eq!(
            c.report(id, NodeId(2), vec![overlap(6, 2, 0), overlap(5, 1, 1)]),
            Ok(true)
        );
        assert!(ready.has_triggered());
        let sets = c.take(id).unwrap().unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].mask.len(), 2);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn no_owners_is_immediately_ready() {
        let c = ReportCollector::new();
        let (id, ready) = c.open([]);
        assert!(ready.has_triggered());
        assert_eq!(c.take(id), Ok(Some(Vec::new())));
    }

    #[test]
    fn stray_reports_rejected() {
        let c = ReportCollector::new();
        let (id, _) = c.open([NodeId(1)]);
        assert_eq!(
            c.report(id, NodeId(4), Vec::new()),
            Err(EqSetError::UnexpectedResponder {
                request: id,
                node: NodeId(4)
            })
        );
        assert_eq!(
            c.report(99, NodeId(1), Vec::new()),
            Err(EqSetError::UnknownRequest { request: 99 })
        );
    }
}
