//! Per-context counters.
//!
//! [`ContextMetrics`] is updated with relaxed atomics from the issuing
//! thread and from meta-tasks; [`ContextMetrics::snapshot`] copies the
//! current values into a plain [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a context's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Operations issued.
    pub issued: u64,
    /// Operations committed.
    pub committed: u64,
    /// Operations whose result was poisoned.
    pub poisoned: u64,
    /// Times the issuing thread blocked on the outstanding-children window.
    pub window_waits: u64,
    /// Times the issuing thread blocked on the frame limit.
    pub frame_waits: u64,
    /// Fill-view cache hits.
    pub fill_cache_hits: u64,
    /// Fill-view cache misses.
    pub fill_cache_misses: u64,
    /// Messages buffered for targets that had not registered yet.
    pub buffered_messages: u64,
    /// Paired barrier reads that needed a wraparound repair.
    pub wraparound_repairs: u64,
}

/// Live counters of one context.
#[derive(Debug, Default)]
pub struct ContextMetrics {
    issued: AtomicU64,
    committed: AtomicU64,
    poisoned: AtomicU64,
    window_waits: AtomicU64,
    frame_waits: AtomicU64,
    fill_cache_hits: AtomicU64,
    fill_cache_misses: AtomicU64,
    buffered_messages: AtomicU64,
    wraparound_repairs: AtomicU64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        #[doc = concat!("Increment `", stringify!($field), "`.")]
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ContextMetrics {
    /// All counters zero.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_issued, issued);
    counter!(record_committed, committed);
    counter!(record_poisoned, poisoned);
    counter!(record_window_wait, window_waits);
    counter!(record_frame_wait, frame_waits);
    counter!(record_fill_hit, fill_cache_hits);
    counter!(record_fill_miss, fill_cache_misses);
    counter!(record_buffered, buffered_messages);
    counter!(record_wraparound_repair, wraparound_repairs);

    /// Copy the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            window_waits: self.window_waits.load(Ordering::Relaxed),
            frame_waits: self.frame_waits.load(Ordering::Relaxed),
            fill_cache_hits: self.fill_cache_hits.load(Ordering::Relaxed),
            fill_cache_misses: self.fill_cache_misses.load(Ordering::Relaxed),
            buffered_messages: self.buffered_messages.load(Ordering::Relaxed),
            wraparound_repairs: self.wraparound_repairs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        assert_eq!(ContextMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn counters_accumulate_independently() {
        let m = ContextMetrics::new();
        m.record_issued();
        m.record_issued();
        m.record_fill_miss();
        m.record_wraparound_repair();
        let s = m.snapshot();
        assert_eq!(s.issued, 2);
        assert_eq!(s.fill_cache_misses, 1);
        assert_eq!(s.wraparound_repairs, 1);
        assert_eq!(s.committed, 0);
    }
}
