//! Local field allocation tracking.
//!
//! Fields allocated by a context are local to it until the context ends.
//! Each field space keeps its local fields in allocation order; copies of
//! the context on other nodes receive them through local-field-update
//! messages and mark them as coming from an ancestor.

use indexmap::IndexMap;
use weft_core::{FieldId, FieldSpaceId};

/// One locally allocated field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalFieldInfo {
    /// Field id.
    pub fid: FieldId,
    /// Field size in bytes.
    pub size: u32,
    /// Allocation slot within the field space.
    pub index: u32,
    /// Whether the field was allocated by another copy of the context.
    pub ancestor: bool,
}

/// Local fields of every field space a context allocated into.
#[derive(Debug, Default)]
pub struct LocalFields {
    spaces: IndexMap<FieldSpaceId, Vec<LocalFieldInfo>>,
}

impl LocalFields {
    /// No local fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field allocated by this context.
    pub fn allocate(&mut self, fs: FieldSpaceId, fid: FieldId, size: u32) -> LocalFieldInfo {
        let fields = self.spaces.entry(fs).or_default();
        let index = fields.iter().map(|f| f.index + 1).max().unwrap_or(0);
        let info = LocalFieldInfo {
            fid,
            size,
            index,
            ancestor: false,
        };
        fields.push(info);
        info
    }

    /// Record fields allocated by another copy of the context. Fields
    /// already known are skipped.
    pub fn record_remote(&mut self, fs: FieldSpaceId, infos: &[LocalFieldInfo]) -> usize {
        let fields = self.spaces.entry(fs).or_default();
        let mut added = 0;
        for info in infos {
            if fields.iter().any(|f| f.fid == info.fid) {
                continue;
            }
            fields.push(LocalFieldInfo {
                ancestor: true,
                ..*info
            });
            added += 1;
        }
        added
    }

    /// Forget a freed field. Returns whether it was local.
    pub fn free(&mut self, fs: FieldSpaceId, fid: FieldId) -> bool {
        let Some(fields) = self.spaces.get_mut(&fs) else {
            return false;
        };
        let before = fields.len();
        fields.retain(|f| f.fid != fid);
        fields.len() != before
    }

    /// Local fields of `fs`, in allocation order.
    pub fn fields(&self, fs: FieldSpaceId) -> Vec<LocalFieldInfo> {
        self.spaces.get(&fs).cloned().unwrap_or_default()
    }

    /// Every field space with its local fields.
    pub fn all(&self) -> Vec<(FieldSpaceId, Vec<LocalFieldInfo>)> {
        self.spaces
            .iter()
            .map(|(fs, fields)| (*fs, fields.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_follow_allocation_order() {
        let mut lf = LocalFields::new();
        let fs = FieldSpaceId(1);
        assert_eq!(lf.allocate(fs, FieldId(10), 8).index, 0);
        assert_eq!(lf.allocate(fs, FieldId(11), 4).index, 1);
        assert!(lf.free(fs, FieldId(10)));
        assert!(!lf.free(fs, FieldId(10)));
        assert_eq!(lf.allocate(fs, FieldId(12), 4).index, 2);
        let fids: Vec<_> = lf.fields(fs).iter().map(|f| f.fid).collect();
        assert_eq!(fids, vec![FieldId(11), FieldId(12)]);
    }

    #[test]
    fn remote_fields_marked_ancestor_once() {
        let mut lf = LocalFields::new();
        let fs = FieldSpaceId(2);
        let info = LocalFieldInfo {
            fid: FieldId(3),
            size: 8,
            index: 0,
            ancestor: false,
        };
        assert_eq!(lf.record_remote(fs, &[info, info]), 1);
        assert!(lf.fields(fs)[0].ancestor);
    }
}
