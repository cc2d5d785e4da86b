//! Peer-to-peer messages.
//!
//! Every message names the target it is for (a context by distributed id,
//! a collective by index, a template by index, a request by number). The
//! receiving side looks the target up in a pending registry, so a message
//! may arrive before its target exists.

use std::fmt;

use weft_core::{
    CollectiveId, DistributedId, FieldMask, FieldSpaceId, LogicalRegion, NodeId, ShardId,
};
use weft_eqset::Rect;

use crate::fields::LocalFieldInfo;

/// What a collective-view message asks of the view's owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewAction {
    /// A collective view was created and must be registered.
    Create,
    /// The view was deleted by its creator.
    Delete,
    /// A remote holder released its reference.
    Release,
}

/// An equivalence set reported by its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetReport {
    /// Set id.
    pub did: DistributedId,
    /// Owner node.
    pub owner: NodeId,
    /// Bounds the set was created for.
    pub bounds: Rect,
    /// Queried fields the set covers.
    pub mask: FieldMask,
}

/// Message exchanged between nodes or between shards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Ask the owner of a context for the equivalence sets of a query.
    EqSetRequest {
        /// Context owning the region requirement.
        context: DistributedId,
        /// Request number on the asking node.
        request: u64,
        /// Region requirement index.
        requirement: u32,
        /// Query rectangle.
        bounds: Rect,
        /// Queried fields.
        mask: FieldMask,
        /// Node to answer.
        reply_to: NodeId,
    },
    /// Answer to [`Message::EqSetRequest`].
    EqSetResponse {
        /// Request number on the asking node.
        request: u64,
        /// Sets found.
        sets: Vec<SetReport>,
    },
    /// A remote copy of a context was released.
    RemoteRelease {
        /// The context.
        context: DistributedId,
    },
    /// Local fields were allocated in a field space of a context.
    LocalFieldUpdate {
        /// The context.
        context: DistributedId,
        /// Field space.
        field_space: FieldSpaceId,
        /// Newly allocated local fields.
        fields: Vec<LocalFieldInfo>,
    },
    /// Regions created by a context, propagated to its remote copies.
    CreatedRegions {
        /// The context.
        context: DistributedId,
        /// The regions.
        regions: Vec<LogicalRegion>,
    },
    /// Collective-view lifecycle.
    CollectiveView {
        /// Context that owns the view.
        context: DistributedId,
        /// What happened.
        action: ViewAction,
        /// The view.
        view: DistributedId,
    },
    /// Payload of a shard collective.
    Collective {
        /// Collective index.
        collective: CollectiveId,
        /// Sending shard.
        from: ShardId,
        /// Raw payload.
        payload: Vec<u8>,
    },
    /// Point-to-point exchange between two shards.
    Rendezvous {
        /// Rendezvous index.
        index: u64,
        /// Sending shard.
        from: ShardId,
        /// Raw payload.
        payload: Vec<u8>,
    },
    /// Update to a sharded physical template.
    TraceUpdate {
        /// Template index.
        template: u64,
        /// Sending shard.
        from: ShardId,
        /// Raw payload.
        payload: Vec<u8>,
    },
}

/// Discriminant of a [`Message`], used as the wire tag and in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// [`Message::EqSetRequest`].
    EqSetRequest = 1,
    /// [`Message::EqSetResponse`].
    EqSetResponse = 2,
    /// [`Message::RemoteRelease`].
    RemoteRelease = 3,
    /// [`Message::LocalFieldUpdate`].
    LocalFieldUpdate = 4,
    /// [`Message::CreatedRegions`].
    CreatedRegions = 5,
    /// [`Message::CollectiveView`].
    CollectiveView = 6,
    /// [`Message::Collective`].
    Collective = 7,
    /// [`Message::Rendezvous`].
    Rendezvous = 8,
    /// [`Message::TraceUpdate`].
    TraceUpdate = 9,
}

impl MessageKind {
    /// Kind for a wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::EqSetRequest,
            2 => Self::EqSetResponse,
            3 => Self::RemoteRelease,
            4 => Self::LocalFieldUpdate,
            5 => Self::CreatedRegions,
            6 => Self::CollectiveView,
            7 => Self::Collective,
            8 => Self::Rendezvous,
            9 => Self::TraceUpdate,
            _ => return None,
        })
    }

    /// Stable name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::EqSetRequest => "eqset-request",
            Self::EqSetResponse => "eqset-response",
            Self::RemoteRelease => "remote-release",
            Self::LocalFieldUpdate => "local-field-update",
            Self::CreatedRegions => "created-regions",
            Self::CollectiveView => "collective-view",
            Self::Collective => "collective",
            Self::Rendezvous => "rendezvous",
            Self::TraceUpdate => "trace-update",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    /// Discriminant.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::EqSetRequest { .. } => MessageKind::EqSetRequest,
            Self::EqSetResponse { .. } => MessageKind::EqSetResponse,
            Self::RemoteRelease { .. } => MessageKind::RemoteRelease,
            Self::LocalFieldUpdate { .. } => MessageKind::LocalFieldUpdate,
            Self::CreatedRegions { .. } => MessageKind::CreatedRegions,
            Self::CollectiveView { .. } => MessageKind::CollectiveView,
            Self::Collective { .. } => MessageKind::Collective,
            Self::Rendezvous { .. } => MessageKind::Rendezvous,
            Self::TraceUpdate { .. } => MessageKind::TraceUpdate,
        }
    }

    /// Context the message is addressed to, for node-level messages.
    pub fn context(&self) -> Option<DistributedId> {
        match self {
            Self::EqSetRequest { context, .. }
            | Self::RemoteRelease { context }
            | Self::LocalFieldUpdate { context, .. }
            | Self::CreatedRegions { context, .. }
            | Self::CollectiveView { context, .. } => Some(*context),
            _ => None,
        }
    }
}
