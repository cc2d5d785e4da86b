//! Back-pressure for the issuing thread.
//!
//! A [`Throttle`] counts outstanding items against a maximum. Acquiring at
//! the maximum parks the caller until releases bring the count down to the
//! resume point, which sits below the maximum by the hysteresis margin so
//! that a blocked issuer is not woken for every single release.
//!
//! The outstanding-children window and the frame limit are both throttles.

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::resume_point;

#[derive(Debug)]
struct ThrottleState {
    outstanding: usize,
    blocked: bool,
}

/// Counting gate with hysteresis.
#[derive(Debug)]
pub struct Throttle {
    name: &'static str,
    max: usize,
    resume_at: usize,
    state: Mutex<ThrottleState>,
    cond: Condvar,
}

impl Throttle {
    /// Throttle admitting `max` outstanding items (at least one).
    pub fn new(name: &'static str, max: usize, hysteresis_percentage: u32) -> Self {
        let max = max.max(1);
        Self {
            name,
            max,
            resume_at: resume_point(max, hysteresis_percentage),
            state: Mutex::new(ThrottleState {
                outstanding: 0,
                blocked: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Take one slot, parking while the throttle is full.
    ///
    /// Returns whether the caller had to wait.
    pub fn acquire(&self) -> bool {
        let mut st = self.state.lock();
        let mut waited = false;
        if st.outstanding >= self.max {
            st.blocked = true;
        }
        if st.blocked {
            waited = true;
            debug!(
                throttle = self.name,
                outstanding = st.outstanding,
                resume_at = self.resume_at,
                "issuer blocked"
            );
            while st.blocked {
                self.cond.wait(&mut st);
            }
        }
        st.outstanding += 1;
        trace!(throttle = self.name, outstanding = st.outstanding, "acquired");
        waited
    }

    /// Return one slot.
    pub fn release(&self) {
        let mut st = self.state.lock();
        st.outstanding = st.outstanding.saturating_sub(1);
        if st.blocked && st.outstanding <= self.resume_at {
            st.blocked = false;
            debug!(throttle = self.name, outstanding = st.outstanding, "issuer resumed");
            self.cond.notify_all();
        }
    }

    /// Number of outstanding items.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Whether an issuer is currently parked.
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Maximum outstanding items.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Count at which a blocked issuer resumes.
    pub fn resume_at(&self) -> usize {
        self.resume_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached");
    }

    #[test]
    fn below_max_never_waits() {
        let t = Throttle::new("t", 3, 0);
        assert!(!t.acquire());
        assert!(!t.acquire());
        assert!(!t.acquire());
        assert_eq!(t.outstanding(), 3);
    }

    #[test]
    fn blocked_issuer_waits_for_hysteresis() {
        let t = Arc::new(Throttle::new("t", 4, 50));
        for _ in 0..4 {
            t.acquire();
        }
        let done = Arc::new(AtomicUsize::new(0));
        let (t2, d2) = (Arc::clone(&t), Arc::clone(&done));
        let h = thread::spawn(move || {
            let waited = t2.acquire();
            d2.store(1, Ordering::SeqCst);
            waited
        });
        wait_until(|| t.is_blocked());
        t.release();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(done.load(Ordering::SeqCst), 0, "resumed above the resume point");
        t.release();
        assert!(h.join().unwrap());
        assert_eq!(t.outstanding(), 3);
    }
}
