//! Error types for equivalence-set bookkeeping.

use std::error::Error;
use std::fmt;

use weft_core::{DistributedId, NodeId};

/// Errors raised by the ownership ledger and remote report accumulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EqSetError {
    /// The distributed id is not tracked.
    UnknownObject {
        /// The id.
        did: DistributedId,
    },
    /// A reference was released more often than it was added.
    ReleaseUnderflow {
        /// The id.
        did: DistributedId,
        /// Holder whose count underflowed; `None` for the local count.
        holder: Option<NodeId>,
    },
    /// A report names a request that is not pending.
    UnknownRequest {
        /// Request number.
        request: u64,
    },
    /// A report came from a node the request did not ask.
    UnexpectedResponder {
        /// Request number.
        request: u64,
        /// Responding node.
        node: NodeId,
    },
}

impl fmt::Display for EqSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownObject { did } => write!(f, "distributed object {did} is not tracked"),
            Self::ReleaseUnderflow { did, holder } => match holder {
                Some(node) => write!(f, "node {node} released {did} more often than it held it"),
                None => write!(f, "local reference to {did} released too often"),
            },
            Self::UnknownRequest { request } => write!(f, "no pending request {request}"),
            Self::UnexpectedResponder { request, node } => {
                write!(f, "node {node} was not asked by request {request}")
            }
        }
    }
}

impl Error for EqSetError {}
