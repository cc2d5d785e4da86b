//! Binary encode/decode of [`Message`]s and remote-context descriptors.
//!
//! All integers are little-endian. Byte arrays are length-prefixed with a
//! `u32` length. A message is a one-byte [`MessageKind`] tag followed by
//! its fields in declaration order.

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};

use weft_core::{
    CollectiveId, DistributedId, FieldId, FieldMask, FieldSpaceId, IndexSpaceId, LogicalRegion,
    NodeId, RegionTreeId, ShardId,
};
use weft_eqset::Rect;

use crate::fields::LocalFieldInfo;
use crate::message::{Message, MessageKind, SetReport, ViewAction};

// ── WireError ──────────────────────────────────────────────────────

/// Errors from encoding or decoding wire data.
#[derive(Debug)]
pub enum WireError {
    /// An I/O error occurred during read or write.
    Io(io::Error),
    /// The data could not be decoded (truncated or corrupt).
    Malformed {
        /// Human-readable description of what went wrong.
        detail: String,
    },
    /// A message tag is not recognized.
    UnknownTag {
        /// The unrecognized tag.
        tag: u8,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Malformed { detail } => write!(f, "malformed wire data: {detail}"),
            Self::UnknownTag { tag } => write!(f, "unknown message tag {tag}"),
        }
    }
}

impl Error for WireError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ── Primitive writers ──────────────────────────────────────────────

/// Write a single byte.
pub fn write_u8(w: &mut dyn Write, v: u8) -> Result<(), WireError> {
    w.write_all(&[v])?;
    Ok(())
}

/// Write a little-endian u32.
pub fn write_u32_le(w: &mut dyn Write, v: u32) -> Result<(), WireError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian u64.
pub fn write_u64_le(w: &mut dyn Write, v: u64) -> Result<(), WireError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a little-endian i64.
pub fn write_i64_le(w: &mut dyn Write, v: i64) -> Result<(), WireError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

/// Write a collection length as a u32.
pub fn write_len(w: &mut dyn Write, len: usize) -> Result<(), WireError> {
    let len = u32::try_from(len).map_err(|_| WireError::Malformed {
        detail: format!("length {len} exceeds u32::MAX"),
    })?;
    write_u32_le(w, len)
}

/// Write a length-prefixed byte array (u32 length + bytes).
pub fn write_length_prefixed_bytes(w: &mut dyn Write, b: &[u8]) -> Result<(), WireError> {
    write_len(w, b.len())?;
    w.write_all(b)?;
    Ok(())
}

// ── Primitive readers ──────────────────────────────────────────────

/// Read a single byte.
pub fn read_u8(r: &mut dyn Read) -> Result<u8, WireError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Read a little-endian u32.
pub fn read_u32_le(r: &mut dyn Read) -> Result<u32, WireError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64.
pub fn read_u64_le(r: &mut dyn Read) -> Result<u64, WireError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a little-endian i64.
pub fn read_i64_le(r: &mut dyn Read) -> Result<i64, WireError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read a collection length written by [`write_len`].
pub fn read_len(r: &mut dyn Read) -> Result<usize, WireError> {
    Ok(read_u32_le(r)? as usize)
}

/// Read a length-prefixed byte array.
pub fn read_length_prefixed_bytes(r: &mut dyn Read) -> Result<Vec<u8>, WireError> {
    let len = read_len(r)?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_bool(r: &mut dyn Read) -> Result<bool, WireError> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(WireError::Malformed {
            detail: format!("invalid bool byte {b}"),
        }),
    }
}

// ── Compound values ────────────────────────────────────────────────

/// Write a rectangle: dimension, then `lo` and `hi` coordinates.
pub fn write_rect(w: &mut dyn Write, rect: &Rect) -> Result<(), WireError> {
    write_len(w, rect.dim())?;
    for &c in rect.lo.iter().chain(rect.hi.iter()) {
        write_i64_le(w, c)?;
    }
    Ok(())
}

/// Read a rectangle written by [`write_rect`].
pub fn read_rect(r: &mut dyn Read) -> Result<Rect, WireError> {
    let dim = read_len(r)?;
    if dim == 0 || dim > 8 {
        return Err(WireError::Malformed {
            detail: format!("rectangle dimension {dim} out of range"),
        });
    }
    let mut lo = Vec::with_capacity(dim);
    for _ in 0..dim {
        lo.push(read_i64_le(r)?);
    }
    let mut hi = Vec::with_capacity(dim);
    for _ in 0..dim {
        hi.push(read_i64_le(r)?);
    }
    Ok(Rect::new(lo, hi))
}

/// Write a field mask as its words.
pub fn write_mask(w: &mut dyn Write, mask: &FieldMask) -> Result<(), WireError> {
    let words = mask.words();
    write_len(w, words.len())?;
    for &word in words {
        write_u64_le(w, word)?;
    }
    Ok(())
}

/// Read a field mask written by [`write_mask`].
pub fn read_mask(r: &mut dyn Read) -> Result<FieldMask, WireError> {
    let n = read_len(r)?;
    let mut words = Vec::with_capacity(n.min(64));
    for _ in 0..n {
        words.push(read_u64_le(r)?);
    }
    Ok(FieldMask::from_words(&words))
}

/// Write a logical region.
pub fn write_region(w: &mut dyn Write, region: &LogicalRegion) -> Result<(), WireError> {
    write_u64_le(w, region.tree.0)?;
    write_u64_le(w, region.index_space.0)?;
    write_u64_le(w, region.field_space.0)
}

/// Read a logical region.
pub fn read_region(r: &mut dyn Read) -> Result<LogicalRegion, WireError> {
    Ok(LogicalRegion {
        tree: RegionTreeId(read_u64_le(r)?),
        index_space: IndexSpaceId(read_u64_le(r)?),
        field_space: FieldSpaceId(read_u64_le(r)?),
    })
}

/// Write a local-field record.
pub fn write_local_field(w: &mut dyn Write, info: &LocalFieldInfo) -> Result<(), WireError> {
    write_u32_le(w, info.fid.0)?;
    write_u32_le(w, info.size)?;
    write_u32_le(w, info.index)?;
    write_u8(w, u8::from(info.ancestor))
}

/// Read a local-field record.
pub fn read_local_field(r: &mut dyn Read) -> Result<LocalFieldInfo, WireError> {
    Ok(LocalFieldInfo {
        fid: FieldId(read_u32_le(r)?),
        size: read_u32_le(r)?,
        index: read_u32_le(r)?,
        ancestor: read_bool(r)?,
    })
}

fn write_view_action(w: &mut dyn Write, action: ViewAction) -> Result<(), WireError> {
    write_u8(
        w,
        match action {
            ViewAction::Create => 0,
            ViewAction::Delete => 1,
            ViewAction::Release => 2,
        },
    )
}

fn read_view_action(r: &mut dyn Read) -> Result<ViewAction, WireError> {
    match read_u8(r)? {
        0 => Ok(ViewAction::Create),
        1 => Ok(ViewAction::Delete),
        2 => Ok(ViewAction::Release),
        b => Err(WireError::Malformed {
            detail: format!("invalid view action {b}"),
        }),
    }
}

// ── Message encode/decode ──────────────────────────────────────────

/// Encode a message.
pub fn encode_message(w: &mut dyn Write, msg: &Message) -> Result<(), WireError> {
    write_u8(w, msg.kind() as u8)?;
    match msg {
        Message::EqSetRequest {
            context,
            request,
            requirement,
            bounds,
            mask,
            reply_to,
        } => {
            write_u64_le(w, context.0)?;
            write_u64_le(w, *request)?;
            write_u32_le(w, *requirement)?;
            write_rect(w, bounds)?;
            write_mask(w, mask)?;
            write_u32_le(w, reply_to.0)?;
        }
        Message::EqSetResponse { request, sets } => {
            write_u64_le(w, *request)?;
            write_len(w, sets.len())?;
            for s in sets {
                write_u64_le(w, s.did.0)?;
                write_u32_le(w, s.owner.0)?;
                write_rect(w, &s.bounds)?;
                write_mask(w, &s.mask)?;
            }
        }
        Message::RemoteRelease { context } => write_u64_le(w, context.0)?,
        Message::LocalFieldUpdate {
            context,
            field_space,
            fields,
        } => {
            write_u64_le(w, context.0)?;
            write_u64_le(w, field_space.0)?;
            write_len(w, fields.len())?;
            for info in fields {
                write_local_field(w, info)?;
            }
        }
        Message::CreatedRegions { context, regions } => {
            write_u64_le(w, context.0)?;
            write_len(w, regions.len())?;
            for region in regions {
                write_region(w, region)?;
            }
        }
        Message::CollectiveView {
            context,
            action,
            view,
        } => {
            write_u64_le(w, context.0)?;
            write_view_action(w, *action)?;
            write_u64_le(w, view.0)?;
        }
        Message::Collective {
            collective,
            from,
            payload,
        } => {
            write_u64_le(w, collective.0)?;
            write_u32_le(w, from.0)?;
            write_length_prefixed_bytes(w, payload)?;
        }
        Message::Rendezvous {
            index,
            from,
            payload,
        } => {
            write_u64_le(w, *index)?;
            write_u32_le(w, from.0)?;
            write_length_prefixed_bytes(w, payload)?;
        }
        Message::TraceUpdate {
            template,
            from,
            payload,
        } => {
            write_u64_le(w, *template)?;
            write_u32_le(w, from.0)?;
            write_length_prefixed_bytes(w, payload)?;
        }
    }
    Ok(())
}

/// Decode a message.
pub fn decode_message(r: &mut dyn Read) -> Result<Message, WireError> {
    let tag = read_u8(r)?;
    let kind = MessageKind::from_tag(tag).ok_or(WireError::UnknownTag { tag })?;
    let msg = match kind {
        MessageKind::EqSetRequest => Message::EqSetRequest {
            context: DistributedId(read_u64_le(r)?),
            request: read_u64_le(r)?,
            requirement: read_u32_le(r)?,
            bounds: read_rect(r)?,
            mask: read_mask(r)?,
            reply_to: NodeId(read_u32_le(r)?),
        },
        MessageKind::EqSetResponse => {
            let request = read_u64_le(r)?;
            let n = read_len(r)?;
            let mut sets = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                sets.push(SetReport {
                    did: DistributedId(read_u64_le(r)?),
                    owner: NodeId(read_u32_le(r)?),
                    bounds: read_rect(r)?,
                    mask: read_mask(r)?,
                });
            }
            Message::EqSetResponse { request, sets }
        }
        MessageKind::RemoteRelease => Message::RemoteRelease {
            context: DistributedId(read_u64_le(r)?),
        },
        MessageKind::LocalFieldUpdate => {
            let context = DistributedId(read_u64_le(r)?);
            let field_space = FieldSpaceId(read_u64_le(r)?);
            let n = read_len(r)?;
            let mut fields = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                fields.push(read_local_field(r)?);
            }
            Message::LocalFieldUpdate {
                context,
                field_space,
                fields,
            }
        }
        MessageKind::CreatedRegions => {
            let context = DistributedId(read_u64_le(r)?);
            let n = read_len(r)?;
            let mut regions = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                regions.push(read_region(r)?);
            }
            Message::CreatedRegions { context, regions }
        }
        MessageKind::CollectiveView => Message::CollectiveView {
            context: DistributedId(read_u64_le(r)?),
            action: read_view_action(r)?,
            view: DistributedId(read_u64_le(r)?),
        },
        MessageKind::Collective => Message::Collective {
            collective: CollectiveId(read_u64_le(r)?),
            from: ShardId(read_u32_le(r)?),
            payload: read_length_prefixed_bytes(r)?,
        },
        MessageKind::Rendezvous => Message::Rendezvous {
            index: read_u64_le(r)?,
            from: ShardId(read_u32_le(r)?),
            payload: read_length_prefixed_bytes(r)?,
        },
        MessageKind::TraceUpdate => Message::TraceUpdate {
            template: read_u64_le(r)?,
            from: ShardId(read_u32_le(r)?),
            payload: read_length_prefixed_bytes(r)?,
        },
    };
    Ok(msg)
}

/// Encode a message into a fresh buffer.
pub fn to_bytes(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    encode_message(&mut buf, msg)?;
    Ok(buf)
}

/// Decode a whole buffer as one message; trailing bytes are an error.
pub fn from_bytes(bytes: &[u8]) -> Result<Message, WireError> {
    let mut cursor = bytes;
    let msg = decode_message(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(WireError::Malformed {
            detail: format!("{} trailing bytes after {}", cursor.len(), msg.kind()),
        });
    }
    Ok(msg)
}
