//! Shard collectives.
//!
//! Every collective registers a [`Gather`] target with the receiving
//! shard's registry before it waits, then sends its own contribution. A
//! contribution that arrives before the receiver registered is buffered by
//! the registry and replayed on registration, so the order in which shards
//! reach a collective does not matter.
//!
//! Completion callbacks are attached only after registration returns.
//! Replayed payloads are delivered under the registry lock; a callback that
//! ran there could not unregister the target.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};
use weft_core::{CollectiveId, ContextError, Event, ProtocolError, ShardId, UserEvent};
use weft_pipeline::Future;

use crate::hash::first_divergence;
use crate::message::Message;
use crate::registry::Deliver;
use crate::replicate::shard::ShardManager;

/// A contribution from one shard.
pub type ShardPayload = (ShardId, Vec<u8>);

// ── Gather ─────────────────────────────────────────────────────────

/// Registry target collecting a fixed number of contributions.
pub struct Gather {
    expected: usize,
    values: Mutex<BTreeMap<ShardId, Vec<u8>>>,
    done: UserEvent,
}

impl Gather {
    /// Target waiting for `expected` contributions.
    pub fn new(expected: usize) -> Arc<Self> {
        let done = UserEvent::new();
        if expected == 0 {
            done.trigger();
        }
        Arc::new(Self {
            expected,
            values: Mutex::new(BTreeMap::new()),
            done,
        })
    }

    /// Triggers once every contribution arrived.
    pub fn event(&self) -> Event {
        self.done.event()
    }

    /// Contributions so far, by shard.
    pub fn values(&self) -> BTreeMap<ShardId, Vec<u8>> {
        self.values.lock().clone()
    }

    /// Contributions received.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether nothing arrived yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deliver<ShardPayload> for Gather {
    fn deliver(&self, (from, payload): ShardPayload) {
        let complete = {
            let mut values = self.values.lock();
            if values.len() >= self.expected {
                warn!(%from, expected = self.expected, "contribution after completion ignored");
                return;
            }
            if values.insert(from, payload).is_some() {
                warn!(%from, "duplicate contribution replaced");
            }
            values.len() == self.expected
        };
        if complete {
            self.done.trigger();
        }
    }
}

impl fmt::Debug for Gather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gather")
            .field("expected", &self.expected)
            .field("received", &self.len())
            .finish()
    }
}

fn wait(gather: &Gather, collective: CollectiveId) -> Result<(), ContextError> {
    gather
        .event()
        .wait()
        .map_err(|_| ContextError::Protocol(ProtocolError::Malformed {
            collective,
            detail: "gather poisoned".into(),
        }))
}

// ── ValueBroadcast ─────────────────────────────────────────────────

/// One shard sends a value; every other shard receives it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueBroadcast {
    collective: CollectiveId,
    origin: ShardId,
}

impl ValueBroadcast {
    /// Broadcast `collective` from `origin`.
    pub fn new(collective: CollectiveId, origin: ShardId) -> Self {
        Self { collective, origin }
    }

    /// Collective index.
    pub fn collective(&self) -> CollectiveId {
        self.collective
    }

    /// Send `value` to every other shard. Called on the origin.
    pub fn broadcast(&self, manager: &ShardManager, value: Vec<u8>) -> Result<(), ContextError> {
        trace!(
            collective = %self.collective,
            origin = %self.origin,
            len = value.len(),
            "broadcast"
        );
        for to in manager.shards().filter(|s| *s != self.origin) {
            manager.send(
                to,
                Message::Collective {
                    collective: self.collective,
                    from: self.origin,
                    payload: value.clone(),
                },
            )?;
        }
        Ok(())
    }

    fn register(
        &self,
        manager: &ShardManager,
        shard: ShardId,
    ) -> Result<Arc<Gather>, ContextError> {
        let gather = Gather::new(1);
        manager
            .collectives(shard)?
            .register(self.collective, gather.clone())?;
        Ok(gather)
    }

    /// Park until the value arrives on `shard`.
    pub fn receive(&self, manager: &ShardManager, shard: ShardId) -> Result<Vec<u8>, ContextError> {
        let gather = self.register(manager, shard)?;
        let waited = wait(&gather, self.collective);
        manager.collectives(shard)?.unregister(&self.collective);
        waited?;
        gather
            .values()
            .remove(&self.origin)
            .ok_or_else(|| ContextError::Protocol(ProtocolError::Malformed {
                collective: self.collective,
                detail: "value came from a shard other than the origin".into(),
            }))
    }

    /// Future of the value on `shard`.
    pub fn receive_async(
        &self,
        manager: &Arc<ShardManager>,
        shard: ShardId,
    ) -> Result<Future, ContextError> {
        let gather = self.register(manager, shard)?;
        let out = Future::pending();
        let result = out.clone();
        let manager = Arc::clone(manager);
        let this = *self;
        gather.event().subscribe(move |poisoned| {
            if let Ok(registry) = manager.collectives(shard) {
                registry.unregister(&this.collective);
            }
            match gather.values().remove(&this.origin) {
                Some(value) if !poisoned => {
                    result.set(value);
                }
                _ => {
                    error!(collective = %this.collective, %shard, "broadcast value lost");
                    result.poison();
                }
            }
        });
        Ok(out)
    }
}

// ── AllGather ──────────────────────────────────────────────────────

/// Every shard contributes a value and receives everyone's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllGather {
    collective: CollectiveId,
}

impl AllGather {
    /// All-gather `collective`.
    pub fn new(collective: CollectiveId) -> Self {
        Self { collective }
    }

    /// Contribute `value` from `shard` and park until every shard has.
    pub fn exchange(
        &self,
        manager: &ShardManager,
        shard: ShardId,
        value: Vec<u8>,
    ) -> Result<BTreeMap<ShardId, Vec<u8>>, ContextError> {
        let gather = Gather::new(manager.total() - 1);
        manager
            .collectives(shard)?
            .register(self.collective, gather.clone())?;
        for to in manager.shards().filter(|s| *s != shard) {
            manager.send(
                to,
                Message::Collective {
                    collective: self.collective,
                    from: shard,
                    payload: value.clone(),
                },
            )?;
        }
        let waited = wait(&gather, self.collective);
        manager.collectives(shard)?.unregister(&self.collective);
        waited?;
        let mut all = gather.values();
        all.insert(shard, value);
        Ok(all)
    }
}

// ── Rendezvous and templates ───────────────────────────────────────

/// Exchange `payload` with `peer` at rendezvous `index`. Both shards call
/// with the same index and receive each other's payload.
pub fn shard_rendezvous(
    manager: &ShardManager,
    shard: ShardId,
    peer: ShardId,
    index: u64,
    payload: Vec<u8>,
) -> Result<Vec<u8>, ContextError> {
    let gather = Gather::new(1);
    let registry = manager.rendezvous(shard)?;
    registry.register(index, gather.clone())?;
    manager.send(
        peer,
        Message::Rendezvous {
            index,
            from: shard,
            payload,
        },
    )?;
    let waited = gather.event().wait();
    registry.unregister(&index);
    if waited.is_err() {
        return Err(ProtocolError::Disconnected { shard: peer }.into());
    }
    gather
        .values()
        .remove(&peer)
        .ok_or_else(|| ProtocolError::Disconnected { shard: peer }.into())
}

/// All-gather of sharded template updates under `exchange`.
pub fn exchange_template_updates(
    manager: &ShardManager,
    shard: ShardId,
    exchange: u64,
    payload: Vec<u8>,
) -> Result<BTreeMap<ShardId, Vec<u8>>, ContextError> {
    let gather = Gather::new(manager.total() - 1);
    let registry = manager.templates(shard)?;
    registry.register(exchange, gather.clone())?;
    for to in manager.shards().filter(|s| *s != shard) {
        manager.send(
            to,
            Message::TraceUpdate {
                template: exchange,
                from: shard,
                payload: payload.clone(),
            },
        )?;
    }
    let waited = gather.event().wait();
    registry.unregister(&exchange);
    if waited.is_err() {
        return Err(ProtocolError::Disconnected { shard }.into());
    }
    let mut all = gather.values();
    all.insert(shard, payload);
    Ok(all)
}

// ── Agreement ──────────────────────────────────────────────────────

/// Encode `u64` values little-endian, back to back.
pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_u64s`].
pub fn decode_u64s(collective: CollectiveId, bytes: &[u8]) -> Result<Vec<u64>, ContextError> {
    if bytes.len() % 8 != 0 {
        return Err(ProtocolError::Malformed {
            collective,
            detail: format!("{} bytes is not a whole number of u64 values", bytes.len()),
        }
        .into());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            u64::from_le_bytes(buf)
        })
        .collect())
}

/// Values of `local` present on every shard, in `local`'s order.
pub fn consensus_match(
    manager: &ShardManager,
    shard: ShardId,
    collective: CollectiveId,
    local: &[u64],
) -> Result<Vec<u64>, ContextError> {
    let all = AllGather::new(collective).exchange(manager, shard, encode_u64s(local))?;
    let mut sets = Vec::with_capacity(all.len());
    for bytes in all.values() {
        sets.push(decode_u64s(collective, bytes)?);
    }
    Ok(local
        .iter()
        .copied()
        .filter(|v| sets.iter().all(|s| s.contains(v)))
        .collect())
}

/// Compare the call hash of every shard. `last_call` names the most
/// recent call on this shard, reported when the hashes differ.
pub fn verify_replicable(
    manager: &ShardManager,
    shard: ShardId,
    collective: CollectiveId,
    hash: u64,
    last_call: &'static str,
) -> Result<(), ContextError> {
    let all = AllGather::new(collective).exchange(manager, shard, encode_u64s(&[hash]))?;
    let mut hashes = Vec::with_capacity(all.len());
    for bytes in all.values() {
        let decoded = decode_u64s(collective, bytes)?;
        hashes.push(decoded.first().copied().unwrap_or_default());
    }
    match first_divergence(&hashes) {
        None => Ok(()),
        Some(i) => {
            let diverged = all.keys().nth(i).copied().unwrap_or(shard);
            error!(%shard, %diverged, call = last_call, "shards diverged");
            Err(ProtocolError::Divergence {
                shard: diverged,
                call: last_call,
            }
            .into())
        }
    }
}
