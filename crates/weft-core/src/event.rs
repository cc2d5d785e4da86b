//! In-process completion events.
//!
//! An [`Event`] is a cloneable handle to a one-shot completion. It starts
//! untriggered, triggers exactly once, and may carry poison. Consumers
//! either park on it ([`Event::wait`]) or register a continuation
//! ([`Event::subscribe`]) that runs on the triggering thread.
//!
//! [`UserEvent`] is the producer side. [`Event::merge`] builds the
//! conjunction of several events.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::Poisoned;

type Continuation = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Default)]
struct EventState {
    triggered: bool,
    poisoned: bool,
    waiters: Vec<Continuation>,
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Handle to a one-shot completion event.
///
/// The default handle is [`Event::NO_EVENT`], which is already triggered.
/// Equality is identity: two handles are equal when they name the same
/// underlying event.
#[derive(Clone, Default)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl Event {
    /// The absent event. Always triggered, never poisoned.
    pub const NO_EVENT: Event = Event { inner: None };

    fn fresh() -> Self {
        Self {
            inner: Some(Arc::new(EventInner {
                state: Mutex::new(EventState::default()),
                cond: Condvar::new(),
            })),
        }
    }

    /// A triggered, poisoned event.
    pub fn poisoned() -> Self {
        let ev = Self::fresh();
        ev.fire(true);
        ev
    }

    /// Whether this handle names a real event (not [`Event::NO_EVENT`]).
    pub fn exists(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether the event has triggered.
    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.state.lock().triggered,
        }
    }

    /// Whether the event has triggered with poison.
    pub fn is_poisoned(&self) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => {
                let st = inner.state.lock();
                st.triggered && st.poisoned
            }
        }
    }

    /// Park the calling thread until the event triggers.
    pub fn wait(&self) -> Result<(), Poisoned> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let mut st = inner.state.lock();
        while !st.triggered {
            inner.cond.wait(&mut st);
        }
        if st.poisoned {
            Err(Poisoned)
        } else {
            Ok(())
        }
    }

    /// Run `f` once when the event triggers.
    ///
    /// The argument is `true` when the event is poisoned. If the event has
    /// already triggered, `f` runs immediately on the calling thread.
    pub fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let Some(inner) = &self.inner else {
            f(false);
            return;
        };
        let mut st = inner.state.lock();
        if st.triggered {
            let poisoned = st.poisoned;
            drop(st);
            f(poisoned);
        } else {
            st.waiters.push(Box::new(f));
        }
    }

    /// Event that triggers once every input has triggered.
    ///
    /// The merged event is poisoned when any input is poisoned. Inputs that
    /// have already triggered cleanly are dropped; a single remaining input
    /// is returned as-is.
    pub fn merge<I>(events: I) -> Event
    where
        I: IntoIterator<Item = Event>,
    {
        let mut pending: Vec<Event> = Vec::new();
        for ev in events {
            if ev.is_poisoned() {
                return Event::poisoned();
            }
            if !ev.has_triggered() && !pending.contains(&ev) {
                pending.push(ev);
            }
        }
        match pending.len() {
            0 => Event::NO_EVENT,
            1 => pending.pop().unwrap_or_default(),
            n => {
                let merged = UserEvent::new();
                let remaining = Arc::new(AtomicUsize::new(n));
                let any_poison = Arc::new(AtomicBool::new(false));
                for ev in pending {
                    let remaining = Arc::clone(&remaining);
                    let any_poison = Arc::clone(&any_poison);
                    let merged = merged.clone();
                    ev.subscribe(move |poisoned| {
                        if poisoned {
                            any_poison.store(true, Ordering::Release);
                        }
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            if any_poison.load(Ordering::Acquire) {
                                merged.poison();
                            } else {
                                merged.trigger();
                            }
                        }
                    });
                }
                merged.event()
            }
        }
    }

    /// Event that triggers once every input has triggered, poisoned or not.
    ///
    /// Unlike [`Event::merge`] the result is never poisoned. Used where an
    /// action must wait for upstream work to settle but must not inherit
    /// its failure.
    pub fn all_settled<I>(events: I) -> Event
    where
        I: IntoIterator<Item = Event>,
    {
        let mut pending: Vec<Event> = Vec::new();
        for ev in events {
            if !ev.has_triggered() && !pending.contains(&ev) {
                pending.push(ev);
            }
        }
        if pending.is_empty() {
            return Event::NO_EVENT;
        }
        let settled = UserEvent::new();
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        for ev in pending {
            let remaining = Arc::clone(&remaining);
            let settled = settled.clone();
            ev.subscribe(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    settled.trigger();
                }
            });
        }
        settled.event()
    }

    fn fire(&self, poisoned: bool) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        let waiters = {
            let mut st = inner.state.lock();
            if st.triggered {
                return false;
            }
            st.triggered = true;
            st.poisoned = poisoned;
            std::mem::take(&mut st.waiters)
        };
        inner.cond.notify_all();
        for w in waiters {
            w(poisoned);
        }
        true
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "Event(none)"),
            Some(inner) => {
                let st = inner.state.lock();
                write!(
                    f,
                    "Event({:p}, triggered={}, poisoned={})",
                    Arc::as_ptr(inner),
                    st.triggered,
                    st.poisoned
                )
            }
        }
    }
}

/// Producer side of an [`Event`].
///
/// Triggering (or poisoning) an already-triggered event is a no-op.
#[derive(Clone, Debug)]
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    /// Create a new untriggered event.
    pub fn new() -> Self {
        Self {
            event: Event::fresh(),
        }
    }

    /// The consumer handle.
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Trigger cleanly. Returns `false` if it had already triggered.
    pub fn trigger(&self) -> bool {
        self.event.fire(false)
    }

    /// Trigger with poison. Returns `false` if it had already triggered.
    pub fn poison(&self) -> bool {
        self.event.fire(true)
    }

    /// Trigger once `pre` triggers, propagating its poison.
    pub fn trigger_after(&self, pre: &Event) {
        let this = self.clone();
        pre.subscribe(move |poisoned| {
            if poisoned {
                this.poison();
            } else {
                this.trigger();
            }
        });
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

// Compile-time assertion: event handles cross thread boundaries.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Event>();
    assert::<UserEvent>();
};
