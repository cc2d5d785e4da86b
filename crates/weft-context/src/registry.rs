//! Registries that tolerate early messages.
//!
//! A message may reach a node before the target it names exists there:
//! a shard can run ahead of its peers, and a context may be addressed
//! before it is unpacked. [`PendingRegistry::find_or_buffer`] delivers to a
//! registered target or appends the payload to a per-key buffer;
//! [`PendingRegistry::register`] replays the buffer in arrival order before
//! any later message can reach the target.
//!
//! Buffers are bounded. Hitting the bound for one key is a protocol
//! violation: the target is assumed never to register. Keys whose target
//! unregistered are retired: a straggler payload for them has no one left
//! to drain it and is dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{error, trace, warn};
use weft_core::ProtocolError;

/// Receiver of payloads routed through a [`PendingRegistry`].
pub trait Deliver<P>: Send + Sync {
    /// Accept one payload.
    ///
    /// Replayed payloads are delivered with the registry lock held, so an
    /// implementation must not call back into the registry that delivers
    /// to it.
    fn deliver(&self, payload: P);
}

/// What [`PendingRegistry::find_or_buffer`] did with a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the registered target.
    Delivered,
    /// Buffered; `count` payloads now wait for the key.
    Buffered {
        /// Buffered payloads for the key, including this one.
        count: usize,
    },
    /// Dropped; the key's target has already unregistered.
    Dropped,
}

struct RegistryState<K, P> {
    targets: HashMap<K, Arc<dyn Deliver<P>>>,
    // Keys in first-buffered order; payloads in arrival order.
    pending: IndexMap<K, Vec<P>>,
    retired: HashSet<K>,
}

/// Targets by key, with per-key buffers for payloads that arrive early.
pub struct PendingRegistry<K, P> {
    name: &'static str,
    bound: usize,
    state: Mutex<RegistryState<K, P>>,
}

impl<K, P> PendingRegistry<K, P>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Registry buffering at most `bound` payloads per unknown key.
    pub fn new(name: &'static str, bound: usize) -> Self {
        Self {
            name,
            bound: bound.max(1),
            state: Mutex::new(RegistryState {
                targets: HashMap::new(),
                pending: IndexMap::new(),
                retired: HashSet::new(),
            }),
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Deliver `payload` to the target of `key`, or buffer it.
    pub fn find_or_buffer(&self, key: K, payload: P) -> Result<Delivery, ProtocolError> {
        let target = {
            let mut st = self.state.lock();
            match st.targets.get(&key).cloned() {
                Some(t) => t,
                None if st.retired.contains(&key) => {
                    warn!(registry = self.name, %key, "payload for retired target dropped");
                    return Ok(Delivery::Dropped);
                }
                None => {
                    let buffered = st.pending.entry(key.clone()).or_default();
                    if buffered.len() >= self.bound {
                        error!(
                            registry = self.name,
                            %key,
                            buffered = buffered.len(),
                            "buffer bound reached for unregistered target"
                        );
                        return Err(ProtocolError::UnregisteredTarget {
                            registry: self.name,
                            key: key.to_string(),
                            buffered: buffered.len(),
                        });
                    }
                    buffered.push(payload);
                    let count = buffered.len();
                    if count == self.bound * 3 / 4 {
                        warn!(
                            registry = self.name,
                            %key,
                            count,
                            bound = self.bound,
                            "buffer nearly full"
                        );
                    } else {
                        trace!(registry = self.name, %key, count, "buffered");
                    }
                    return Ok(Delivery::Buffered { count });
                }
            }
        };
        target.deliver(payload);
        Ok(Delivery::Delivered)
    }

    /// Register the target of `key` and replay its buffered payloads.
    ///
    /// Returns the number of replayed payloads.
    pub fn register(&self, key: K, target: Arc<dyn Deliver<P>>) -> Result<usize, ProtocolError> {
        let mut st = self.state.lock();
        if st.targets.contains_key(&key) {
            return Err(ProtocolError::DuplicateTarget {
                registry: self.name,
                key: key.to_string(),
            });
        }
        st.retired.remove(&key);
        st.targets.insert(key.clone(), Arc::clone(&target));
        let buffered = st.pending.shift_remove(&key).unwrap_or_default();
        let n = buffered.len();
        if n > 0 {
            trace!(registry = self.name, %key, replayed = n, "replaying buffered payloads");
        }
        // Replay under the lock so later payloads cannot overtake.
        for payload in buffered {
            target.deliver(payload);
        }
        Ok(n)
    }

    /// Remove the target of `key` and retire the key. Later payloads for
    /// it are dropped until it registers again.
    pub fn unregister(&self, key: &K) -> Option<Arc<dyn Deliver<P>>> {
        let mut st = self.state.lock();
        let target = st.targets.remove(key)?;
        st.retired.insert(key.clone());
        Some(target)
    }

    /// Whether `key` unregistered and has not registered again.
    pub fn is_retired(&self, key: &K) -> bool {
        self.state.lock().retired.contains(key)
    }

    /// Whether `key` has a registered target.
    pub fn is_registered(&self, key: &K) -> bool {
        self.state.lock().targets.contains_key(key)
    }

    /// Payloads buffered for `key`.
    pub fn pending_len(&self, key: &K) -> usize {
        self.state.lock().pending.get(key).map_or(0, Vec::len)
    }

    /// Payloads buffered across all keys.
    pub fn total_pending(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }
}

impl<K, P> fmt::Debug for PendingRegistry<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("PendingRegistry")
            .field("name", &self.name)
            .field("bound", &self.bound)
            .field("targets", &st.targets.len())
            .field("pending_keys", &st.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink(Mutex<Vec<u32>>);

    impl Deliver<u32> for Sink {
        fn deliver(&self, payload: u32) {
            self.0.lock().push(payload);
        }
    }

    #[test]
    fn early_payloads_replay_in_arrival_order() {
        let reg: PendingRegistry<u64, u32> = PendingRegistry::new("collectives", 16);
        assert_eq!(reg.find_or_buffer(7, 1), Ok(Delivery::Buffered { count: 1 }));
        assert_eq!(reg.find_or_buffer(7, 2), Ok(Delivery::Buffered { count: 2 }));
        assert_eq!(reg.find_or_buffer(8, 9), Ok(Delivery::Buffered { count: 1 }));
        let sink = Arc::new(Sink::default());
        assert_eq!(reg.register(7, sink.clone()), Ok(2));
        assert_eq!(reg.find_or_buffer(7, 3), Ok(Delivery::Delivered));
        assert_eq!(*sink.0.lock(), vec![1, 2, 3]);
        assert_eq!(reg.pending_len(&8), 1);
        assert_eq!(reg.total_pending(), 1);
    }

    #[test]
    fn bound_is_a_protocol_error() {
        let reg: PendingRegistry<u64, u32> = PendingRegistry::new("rendezvous", 2);
        reg.find_or_buffer(1, 0).unwrap();
        reg.find_or_buffer(1, 0).unwrap();
        assert_eq!(
            reg.find_or_buffer(1, 0),
            Err(ProtocolError::UnregisteredTarget {
                registry: "rendezvous",
                key: "1".into(),
                buffered: 2
            })
        );
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg: PendingRegistry<u64, u32> = PendingRegistry::new("templates", 4);
        reg.register(1, Arc::new(Sink::default())).unwrap();
        assert!(matches!(
            reg.register(1, Arc::new(Sink::default())),
            Err(ProtocolError::DuplicateTarget { .. })
        ));
        assert!(reg.unregister(&1).is_some());
        assert!(reg.unregister(&1).is_none());
    }

    #[test]
    fn late_payloads_for_retired_keys_are_dropped() {
        let reg: PendingRegistry<u64, u32> = PendingRegistry::new("collectives", 4);
        let sink = Arc::new(Sink::default());
        reg.register(3, sink.clone()).unwrap();
        reg.find_or_buffer(3, 1).unwrap();
        reg.unregister(&3);
        assert!(reg.is_retired(&3));
        for n in 0..10 {
            assert_eq!(reg.find_or_buffer(3, n), Ok(Delivery::Dropped));
        }
        assert_eq!(reg.pending_len(&3), 0);
        assert_eq!(reg.total_pending(), 0);
        assert_eq!(*sink.0.lock(), vec![1]);

        // Registering again revives the key.
        let again = Arc::new(Sink::default());
        reg.register(3, again.clone()).unwrap();
        assert!(!reg.is_retired(&3));
        assert_eq!(reg.find_or_buffer(3, 7), Ok(Delivery::Delivered));
        assert_eq!(*again.0.lock(), vec![7]);
    }
}
