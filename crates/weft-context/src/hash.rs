//! Deterministic hashing of call streams and operation signatures.
//!
//! Uses FNV-1a so that every shard computes the same value for the same
//! input with no per-process seeding. These hashes are not
//! cryptographically secure; they only detect divergence between shards
//! and mismatched trace templates.

use weft_core::FieldMask;
use weft_pipeline::{OpKind, Privilege, RegionRequirement};

/// FNV-1a offset basis for 64-bit.
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
/// FNV-1a prime for 64-bit.
const FNV_PRIME: u64 = 0x00000100000001B3;

#[inline]
fn fnv1a_byte(hash: u64, byte: u8) -> u64 {
    (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
}

#[inline]
fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash = fnv1a_byte(hash, b);
    }
    hash
}

#[inline]
fn fnv1a_u32(hash: u64, v: u32) -> u64 {
    fnv1a_bytes(hash, &v.to_le_bytes())
}

#[inline]
fn fnv1a_u64(hash: u64, v: u64) -> u64 {
    fnv1a_bytes(hash, &v.to_le_bytes())
}

fn fnv1a_mask(mut hash: u64, mask: &FieldMask) -> u64 {
    hash = fnv1a_u32(hash, mask.words().len() as u32);
    for &w in mask.words() {
        hash = fnv1a_u64(hash, w);
    }
    hash
}

fn privilege_tag(p: Privilege) -> u64 {
    match p {
        Privilege::NoAccess => 0,
        Privilege::ReadOnly => 1,
        Privilege::ReadWrite => 2,
        Privilege::WriteDiscard => 3,
        Privilege::Reduce(op) => 4 | (u64::from(op.0) << 8),
    }
}

/// Hash of an operation's kind and region requirements.
///
/// Operations with equal signatures are interchangeable in a trace.
pub fn op_signature(kind: OpKind, requirements: &[RegionRequirement]) -> u64 {
    let mut hash = fnv1a_bytes(FNV_OFFSET, kind.name().as_bytes());
    hash = fnv1a_u32(hash, requirements.len() as u32);
    for req in requirements {
        hash = fnv1a_u64(hash, req.region.tree.0);
        hash = fnv1a_u64(hash, req.region.index_space.0);
        hash = fnv1a_u64(hash, req.region.field_space.0);
        hash = fnv1a_mask(hash, &req.fields);
        hash = fnv1a_u64(hash, privilege_tag(req.privilege));
    }
    hash
}

/// Hash of a sequence of operation signatures.
pub fn sequence_hash(signatures: &[u64]) -> u64 {
    signatures
        .iter()
        .fold(fnv1a_u32(FNV_OFFSET, signatures.len() as u32), |h, s| {
            fnv1a_u64(h, *s)
        })
}

/// Running hash of the API calls made by one shard.
#[derive(Clone, Debug)]
pub struct CallHasher {
    hash: u64,
    calls: u64,
    last: &'static str,
}

impl CallHasher {
    /// No calls recorded.
    pub fn new() -> Self {
        Self {
            hash: FNV_OFFSET,
            calls: 0,
            last: "",
        }
    }

    /// Fold `call` into the hash.
    pub fn record(&mut self, call: &'static str) {
        self.hash = fnv1a_bytes(self.hash, call.as_bytes());
        self.hash = fnv1a_byte(self.hash, 0);
        self.calls += 1;
        self.last = call;
    }

    /// Current hash.
    pub fn value(&self) -> u64 {
        self.hash
    }

    /// Number of recorded calls.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Most recent call, empty before the first.
    pub fn last_call(&self) -> &'static str {
        self.last
    }
}

impl Default for CallHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the first hash that differs from the first one.
pub fn first_divergence(hashes: &[u64]) -> Option<usize> {
    let first = *hashes.first()?;
    hashes.iter().position(|h| *h != first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{FieldId, FieldSpaceId, IndexSpaceId, LogicalRegion, RegionTreeId};

    fn req(tree: u64, privilege: Privilege) -> RegionRequirement {
        RegionRequirement::new(
            LogicalRegion {
                tree: RegionTreeId(tree),
                index_space: IndexSpaceId(1),
                field_space: FieldSpaceId(1),
            },
            [FieldId(0)].into_iter().collect(),
            privilege,
        )
    }

    #[test]
    fn empty_stream_hashes_to_offset() {
        assert_eq!(CallHasher::new().value(), FNV_OFFSET);
    }

    #[test]
    fn call_order_matters() {
        let mut a = CallHasher::new();
        a.record("fill_fields");
        a.record("issue_copy");
        let mut b = CallHasher::new();
        b.record("issue_copy");
        b.record("fill_fields");
        assert_ne!(a.value(), b.value());
        assert_eq!(a.calls(), 2);
        assert_eq!(a.last_call(), "issue_copy");
    }

    #[test]
    fn call_boundaries_matter() {
        let mut a = CallHasher::new();
        a.record("ab");
        a.record("c");
        let mut b = CallHasher::new();
        b.record("a");
        b.record("bc");
        assert_ne!(a.value(), b.value());
    }

    #[test]
    fn signature_sees_privilege_and_tree() {
        let base = op_signature(OpKind::Fill, &[req(1, Privilege::ReadWrite)]);
        assert_eq!(base, op_signature(OpKind::Fill, &[req(1, Privilege::ReadWrite)]));
        assert_ne!(base, op_signature(OpKind::Fill, &[req(1, Privilege::ReadOnly)]));
        assert_ne!(base, op_signature(OpKind::Fill, &[req(2, Privilege::ReadWrite)]));
        assert_ne!(base, op_signature(OpKind::Copy, &[req(1, Privilege::ReadWrite)]));
    }

    #[test]
    fn divergence_points_at_first_outlier() {
        assert_eq!(first_divergence(&[]), None);
        assert_eq!(first_divergence(&[5, 5, 5]), None);
        assert_eq!(first_divergence(&[5, 5, 6, 7]), Some(2));
    }
}
