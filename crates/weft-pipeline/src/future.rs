//! Futures and predicates.
//!
//! A [`Future`] is a write-once byte value paired with a readiness event.
//! A [`Predicate`] is a future interpreted as a boolean; combinators build
//! new predicates that resolve once their inputs do.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Event, Poisoned, UserEvent};

struct FutureInner {
    ready: UserEvent,
    value: Mutex<Option<Result<Vec<u8>, Poisoned>>>,
}

/// Write-once value produced by an operation.
#[derive(Clone)]
pub struct Future {
    inner: Arc<FutureInner>,
}

impl Future {
    /// An unresolved future.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                ready: UserEvent::new(),
                value: Mutex::new(None),
            }),
        }
    }

    /// A future already resolved to `bytes`.
    pub fn from_value(bytes: impl Into<Vec<u8>>) -> Self {
        let f = Self::pending();
        f.set(bytes.into());
        f
    }

    /// A resolved empty future.
    pub fn empty() -> Self {
        Self::from_value(Vec::new())
    }

    /// Resolve with a value. Returns `false` if already resolved.
    pub fn set(&self, bytes: Vec<u8>) -> bool {
        {
            let mut v = self.inner.value.lock();
            if v.is_some() {
                return false;
            }
            *v = Some(Ok(bytes));
        }
        self.inner.ready.trigger()
    }

    /// Resolve as poisoned. Returns `false` if already resolved.
    pub fn poison(&self) -> bool {
        {
            let mut v = self.inner.value.lock();
            if v.is_some() {
                return false;
            }
            *v = Some(Err(Poisoned));
        }
        self.inner.ready.poison()
    }

    /// Event triggered on resolution.
    pub fn ready_event(&self) -> Event {
        self.inner.ready.event()
    }

    /// Whether the future has resolved.
    pub fn is_ready(&self) -> bool {
        self.inner.value.lock().is_some()
    }

    /// Value if resolved, without blocking.
    pub fn try_get(&self) -> Option<Result<Vec<u8>, Poisoned>> {
        self.inner.value.lock().clone()
    }

    /// Block until resolved and return the value.
    pub fn get(&self) -> Result<Vec<u8>, Poisoned> {
        // Poison is reported through the stored value, not the event.
        let _ = self.inner.ready.event().wait();
        self.try_get().unwrap_or(Err(Poisoned))
    }

    /// Run `f` with the resolved value.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<Vec<u8>, Poisoned>) + Send + 'static,
    {
        let this = self.clone();
        self.ready_event().subscribe(move |_| {
            f(this.try_get().unwrap_or(Err(Poisoned)));
        });
    }

    /// Whether two handles name the same future.
    pub fn same(&self, other: &Future) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("value", &*self.inner.value.lock())
            .finish()
    }
}

/// Boolean future gating predicated operations.
///
/// Poison is not a truth value: a predicate over a poisoned future is
/// poisoned, every combinator over it is poisoned, and an operation
/// predicated on it is poisoned rather than skipped.
#[derive(Clone, Debug)]
pub struct Predicate {
    future: Future,
}

impl Predicate {
    /// Predicate that is always true.
    pub fn always() -> Self {
        Self::constant(true)
    }

    /// Predicate that is always false.
    pub fn never() -> Self {
        Self::constant(false)
    }

    fn constant(value: bool) -> Self {
        Self {
            future: Future::from_value(vec![u8::from(value)]),
        }
    }

    /// Predicate backed by `future`. Any non-zero byte reads as true.
    pub fn from_future(future: Future) -> Self {
        Self { future }
    }

    /// Event triggered once the value is known.
    pub fn ready_event(&self) -> Event {
        self.future.ready_event()
    }

    /// Resolved value, if known.
    pub fn try_value(&self) -> Option<Result<bool, Poisoned>> {
        self.future.try_get().map(|r| r.map(|bytes| truthy(&bytes)))
    }

    /// Block until resolved.
    pub fn value(&self) -> Result<bool, Poisoned> {
        self.future.get().map(|bytes| truthy(&bytes))
    }

    /// Logical negation.
    pub fn not(&self) -> Predicate {
        let out = Future::pending();
        let o = out.clone();
        let src = self.clone();
        self.ready_event().subscribe(move |_| match src.try_value() {
            Some(Ok(v)) => {
                o.set(vec![u8::from(!v)]);
            }
            _ => {
                o.poison();
            }
        });
        Predicate { future: out }
    }

    /// Conjunction of `preds`. The empty conjunction is true.
    pub fn and(preds: &[Predicate]) -> Predicate {
        Self::fold(preds, true, |a, b| a && b)
    }

    /// Disjunction of `preds`. The empty disjunction is false.
    pub fn or(preds: &[Predicate]) -> Predicate {
        Self::fold(preds, false, |a, b| a || b)
    }

    fn fold(preds: &[Predicate], init: bool, op: fn(bool, bool) -> bool) -> Predicate {
        let out = Future::pending();
        let o = out.clone();
        if preds.is_empty() {
            out.set(vec![u8::from(init)]);
            return Predicate { future: out };
        }
        // Poisoned inputs must not short-circuit the wait, so count
        // resolutions instead of merging the readiness events.
        let inputs: Arc<Vec<Predicate>> = Arc::new(preds.to_vec());
        let remaining = Arc::new(AtomicUsize::new(inputs.len()));
        for p in inputs.iter() {
            let o = o.clone();
            let inputs = Arc::clone(&inputs);
            let remaining = Arc::clone(&remaining);
            p.ready_event().subscribe(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let folded = inputs.iter().try_fold(init, |acc, p| {
                    p.try_value().unwrap_or(Err(Poisoned)).map(|v| op(acc, v))
                });
                match folded {
                    Ok(v) => {
                        o.set(vec![u8::from(v)]);
                    }
                    Err(Poisoned) => {
                        o.poison();
                    }
                }
            });
        }
        Predicate { future: out }
    }
}

fn truthy(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| *b != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once() {
        let f = Future::pending();
        assert!(!f.is_ready());
        assert!(f.set(vec![1, 2]));
        assert!(!f.set(vec![3]));
        assert!(!f.poison());
        assert_eq!(f.get(), Ok(vec![1, 2]));
    }

    #[test]
    fn poisoned_future_reports_poison() {
        let f = Future::pending();
        f.poison();
        assert_eq!(f.get(), Err(Poisoned));
        assert!(f.ready_event().is_poisoned());
    }

    #[test]
    fn on_ready_sees_value() {
        let f = Future::pending();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        f.on_ready(move |v| *s.lock() = Some(v));
        f.set(vec![9]);
        assert_eq!(*seen.lock(), Some(Ok(vec![9])));
    }

    #[test]
    fn predicate_combinators() {
        let t = Predicate::always();
        let f = Predicate::never();
        assert_eq!(t.not().value(), Ok(false));
        assert_eq!(Predicate::and(&[t.clone(), t.clone()]).value(), Ok(true));
        assert_eq!(Predicate::and(&[t.clone(), f.clone()]).value(), Ok(false));
        assert_eq!(Predicate::or(&[f.clone(), t.clone()]).value(), Ok(true));
        assert_eq!(Predicate::or(&[]).value(), Ok(false));
        assert_eq!(Predicate::and(&[]).value(), Ok(true));
    }

    #[test]
    fn pending_predicate_resolves_later() {
        let src = Future::pending();
        let p = Predicate::from_future(src.clone());
        let n = p.not();
        assert_eq!(n.try_value(), None);
        src.set(vec![0]);
        assert_eq!(n.try_value(), Some(Ok(true)));
    }

    #[test]
    fn poison_survives_combinators() {
        let src = Future::pending();
        src.poison();
        let p = Predicate::from_future(src);
        assert_eq!(p.value(), Err(Poisoned));
        assert_eq!(p.not().value(), Err(Poisoned));
        // A false input does not hide a poisoned one.
        let and = Predicate::and(&[Predicate::never(), p.clone()]);
        assert_eq!(and.value(), Err(Poisoned));
        let or = Predicate::or(&[Predicate::always(), p]);
        assert_eq!(or.value(), Err(Poisoned));
    }
}
