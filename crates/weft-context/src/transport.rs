//! Node-to-node message transport.
//!
//! A [`Network`] connects a fixed set of in-process nodes. Each node has a
//! crossbeam mailbox drained by one dispatcher thread that decodes every
//! envelope and hands the message to the node's [`Inbox`]. Messages travel
//! encoded, so every peer-to-peer message exercises the wire codec.
//!
//! Messages from one sender to one receiver are delivered in send order.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace};
use weft_core::{NodeId, ProtocolError};

use crate::config::ConfigError;
use crate::message::Message;
use crate::wire;

/// Receiving side of a node.
pub trait Inbox: Send + Sync {
    /// Handle one decoded message from `from`.
    fn handle(&self, from: NodeId, msg: Message);
}

/// Encoded message in flight.
#[derive(Debug)]
pub struct Envelope {
    /// Sending node.
    pub from: NodeId,
    /// Encoded message.
    pub bytes: Vec<u8>,
}

/// In-process network of nodes.
pub struct Network {
    senders: RwLock<Vec<Sender<Envelope>>>,
    receivers: Mutex<Vec<Option<Receiver<Envelope>>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher_ids: Mutex<Vec<ThreadId>>,
}

impl Network {
    /// Network of `nodes` nodes, numbered from zero.
    pub fn new(nodes: usize) -> Arc<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..nodes)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::unbounded();
                (tx, Some(rx))
            })
            .unzip();
        Arc::new(Self {
            senders: RwLock::new(senders),
            receivers: Mutex::new(receivers),
            dispatchers: Mutex::new(Vec::new()),
            dispatcher_ids: Mutex::new(Vec::new()),
        })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Whether the network has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the dispatcher of `node`, delivering to `inbox`.
    ///
    /// The dispatcher holds the inbox weakly and exits once the inbox is
    /// gone or the network shuts down.
    pub fn attach(&self, node: NodeId, inbox: Weak<dyn Inbox>) -> Result<(), ConfigError> {
        let rx = self
            .receivers
            .lock()
            .get_mut(node.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| ConfigError::ThreadSpawnFailed {
                reason: format!("node {node} is not free to attach"),
            })?;
        let handle = thread::Builder::new()
            .name(format!("weft-node-{}", node.0))
            .spawn(move || dispatch_loop(node, rx, inbox))
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("dispatcher for node {node}: {e}"),
            })?;
        self.dispatcher_ids.lock().push(handle.thread().id());
        self.dispatchers.lock().push(handle);
        debug!(node = %node, "node attached");
        Ok(())
    }

    /// Encode `msg` and post it to `to`'s mailbox. Never blocks.
    pub fn send(&self, from: NodeId, to: NodeId, msg: &Message) -> Result<(), ProtocolError> {
        let bytes = wire::to_bytes(msg).map_err(|e| ProtocolError::Undeliverable {
            node: to,
            detail: e.to_string(),
        })?;
        let senders = self.senders.read();
        let tx = senders
            .get(to.0 as usize)
            .ok_or_else(|| ProtocolError::Undeliverable {
                node: to,
                detail: "no such node".into(),
            })?;
        trace!(from = %from, to = %to, kind = %msg.kind(), len = bytes.len(), "send");
        tx.send(Envelope { from, bytes })
            .map_err(|_| ProtocolError::Undeliverable {
                node: to,
                detail: "mailbox closed".into(),
            })
    }

    /// Close every mailbox and join the dispatchers.
    ///
    /// Called from a dispatcher thread, the join is skipped; dispatchers
    /// exit on their own once their mailbox drains.
    pub fn shutdown(&self) {
        self.senders.write().clear();
        if self.dispatcher_ids.lock().contains(&thread::current().id()) {
            return;
        }
        let handles: Vec<_> = self.dispatchers.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

fn dispatch_loop(node: NodeId, rx: Receiver<Envelope>, inbox: Weak<dyn Inbox>) {
    while let Ok(env) = rx.recv() {
        let msg = match wire::from_bytes(&env.bytes) {
            Ok(m) => m,
            Err(e) => {
                error!(node = %node, from = %env.from, error = %e, "undecodable message dropped");
                continue;
            }
        };
        let Some(inbox) = inbox.upgrade() else {
            debug!(node = %node, "inbox gone; dispatcher exiting");
            return;
        };
        inbox.handle(env.from, msg);
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.len())
            .field("dispatchers", &self.dispatchers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::RecvTimeoutError;
    use std::time::Duration;
    use weft_core::DistributedId;

    struct Forward(Sender<(NodeId, Message)>);

    impl Inbox for Forward {
        fn handle(&self, from: NodeId, msg: Message) {
            let _ = self.0.send((from, msg));
        }
    }

    #[test]
    fn messages_arrive_decoded_and_in_order() {
        let net = Network::new(2);
        let (tx, rx) = crossbeam_channel::unbounded();
        let inbox: Arc<dyn Inbox> = Arc::new(Forward(tx));
        net.attach(NodeId(1), Arc::downgrade(&inbox)).unwrap();
        for i in 0..5 {
            let msg = Message::RemoteRelease {
                context: DistributedId(i),
            };
            net.send(NodeId(0), NodeId(1), &msg).unwrap();
        }
        for i in 0..5 {
            let (from, msg) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(from, NodeId(0));
            assert_eq!(
                msg,
                Message::RemoteRelease {
                    context: DistributedId(i)
                }
            );
        }
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(20)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn send_after_shutdown_is_undeliverable() {
        let net = Network::new(1);
        net.shutdown();
        let err = net
            .send(
                NodeId(0),
                NodeId(0),
                &Message::RemoteRelease {
                    context: DistributedId(1),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Undeliverable { .. }));
    }

    #[test]
    fn node_attaches_once() {
        let net = Network::new(1);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let inbox: Arc<dyn Inbox> = Arc::new(Forward(tx));
        net.attach(NodeId(0), Arc::downgrade(&inbox)).unwrap();
        assert!(net.attach(NodeId(0), Arc::downgrade(&inbox)).is_err());
    }
}
