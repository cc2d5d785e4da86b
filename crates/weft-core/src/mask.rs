//! The [`FieldMask`] bitset.

use smallvec::SmallVec;

use crate::id::FieldId;

/// A set of field IDs implemented as a dynamically-sized bitset.
///
/// Region requirements, equivalence sets and dependence records all carry a
/// mask naming the fields they cover. Masks up to 128 fields stay inline.
#[derive(Clone, Debug, Default)]
pub struct FieldMask {
    bits: SmallVec<[u64; 2]>,
}

impl FieldMask {
    const BITS_PER_WORD: usize = 64;

    /// Create an empty mask.
    pub fn empty() -> Self {
        Self {
            bits: SmallVec::new(),
        }
    }

    /// Mask containing fields `0..count`.
    pub fn first_n(count: u32) -> Self {
        (0..count).map(FieldId).collect()
    }

    /// Insert a field ID into the mask.
    pub fn insert(&mut self, field: FieldId) {
        let word = field.0 as usize / Self::BITS_PER_WORD;
        let bit = field.0 as usize % Self::BITS_PER_WORD;
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1u64 << bit;
    }

    /// Remove a field ID from the mask.
    pub fn remove(&mut self, field: FieldId) {
        let word = field.0 as usize / Self::BITS_PER_WORD;
        let bit = field.0 as usize % Self::BITS_PER_WORD;
        if word < self.bits.len() {
            self.bits[word] &= !(1u64 << bit);
            self.trim();
        }
    }

    /// Check whether the mask contains a field ID.
    pub fn contains(&self, field: FieldId) -> bool {
        let word = field.0 as usize / Self::BITS_PER_WORD;
        let bit = field.0 as usize % Self::BITS_PER_WORD;
        word < self.bits.len() && (self.bits[word] & (1u64 << bit)) != 0
    }

    /// Return the union of two masks (`self | other`).
    pub fn union(&self, other: &Self) -> Self {
        let max_len = self.bits.len().max(other.bits.len());
        let mut bits = SmallVec::with_capacity(max_len);
        for i in 0..max_len {
            let a = self.bits.get(i).copied().unwrap_or(0);
            let b = other.bits.get(i).copied().unwrap_or(0);
            bits.push(a | b);
        }
        Self { bits }
    }

    /// Return the intersection of two masks (`self & other`).
    pub fn intersection(&self, other: &Self) -> Self {
        let min_len = self.bits.len().min(other.bits.len());
        let mut bits = SmallVec::with_capacity(min_len);
        for i in 0..min_len {
            bits.push(self.bits[i] & other.bits[i]);
        }
        let mut out = Self { bits };
        out.trim();
        out
    }

    /// Return the difference (`self - other`).
    pub fn difference(&self, other: &Self) -> Self {
        let mut bits = SmallVec::with_capacity(self.bits.len());
        for i in 0..self.bits.len() {
            let b = other.bits.get(i).copied().unwrap_or(0);
            bits.push(self.bits[i] & !b);
        }
        let mut out = Self { bits };
        out.trim();
        out
    }

    /// In-place union.
    pub fn union_with(&mut self, other: &Self) {
        if other.bits.len() > self.bits.len() {
            self.bits.resize(other.bits.len(), 0);
        }
        for (i, w) in other.bits.iter().enumerate() {
            self.bits[i] |= *w;
        }
    }

    /// In-place difference.
    pub fn subtract(&mut self, other: &Self) {
        for (i, w) in self.bits.iter_mut().enumerate() {
            *w &= !other.bits.get(i).copied().unwrap_or(0);
        }
        self.trim();
    }

    /// Whether the two masks share any field.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Check whether `self` is a subset of `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        for i in 0..self.bits.len() {
            let b = other.bits.get(i).copied().unwrap_or(0);
            if self.bits[i] & !b != 0 {
                return false;
            }
        }
        true
    }

    /// Returns `true` if the mask contains no fields.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Returns the number of fields in the mask.
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Lowest field in the mask.
    pub fn first(&self) -> Option<FieldId> {
        self.iter().next()
    }

    /// Iterate over the field IDs in the mask, in ascending order.
    pub fn iter(&self) -> FieldMaskIter<'_> {
        FieldMaskIter {
            bits: &self.bits,
            word_idx: 0,
            bit_idx: 0,
        }
    }

    /// Raw words, lowest field first. Trailing zero words are not stored.
    pub fn words(&self) -> &[u64] {
        &self.bits
    }

    /// Rebuild a mask from raw words.
    pub fn from_words(words: &[u64]) -> Self {
        let mut out = Self {
            bits: SmallVec::from_slice(words),
        };
        out.trim();
        out
    }

    fn trim(&mut self) {
        while self.bits.last() == Some(&0) {
            self.bits.pop();
        }
    }
}

impl PartialEq for FieldMask {
    fn eq(&self, other: &Self) -> bool {
        let max_len = self.bits.len().max(other.bits.len());
        for i in 0..max_len {
            let a = self.bits.get(i).copied().unwrap_or(0);
            let b = other.bits.get(i).copied().unwrap_or(0);
            if a != b {
                return false;
            }
        }
        true
    }
}

impl Eq for FieldMask {}

impl FromIterator<FieldId> for FieldMask {
    fn from_iter<I: IntoIterator<Item = FieldId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for field in iter {
            mask.insert(field);
        }
        mask
    }
}

impl<'a> IntoIterator for &'a FieldMask {
    type Item = FieldId;
    type IntoIter = FieldMaskIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over field IDs in a [`FieldMask`], yielding IDs in ascending order.
pub struct FieldMaskIter<'a> {
    bits: &'a [u64],
    word_idx: usize,
    bit_idx: usize,
}

impl Iterator for FieldMaskIter<'_> {
    type Item = FieldId;

    fn next(&mut self) -> Option<Self::Item> {
        while self.word_idx < self.bits.len() {
            let word = self.bits[self.word_idx];
            while self.bit_idx < 64 {
                let bit = self.bit_idx;
                self.bit_idx += 1;
                if word & (1u64 << bit) != 0 {
                    return Some(FieldId((self.word_idx * 64 + bit) as u32));
                }
            }
            self.word_idx += 1;
            self.bit_idx = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_mask() -> impl Strategy<Value = FieldMask> {
        prop::collection::vec(0u32..200, 0..32)
            .prop_map(|ids| ids.into_iter().map(FieldId).collect::<FieldMask>())
    }

    #[test]
    fn insert_remove() {
        let mut m = FieldMask::empty();
        m.insert(FieldId(3));
        m.insert(FieldId(130));
        assert_eq!(m.len(), 2);
        m.remove(FieldId(130));
        assert_eq!(m.words().len(), 1);
        assert!(m.contains(FieldId(3)));
        assert!(!m.contains(FieldId(130)));
    }

    #[test]
    fn first_n_covers_prefix() {
        let m = FieldMask::first_n(5);
        assert_eq!(m.iter().collect::<Vec<_>>().len(), 5);
        assert_eq!(m.first(), Some(FieldId(0)));
    }

    proptest! {
        #[test]
        fn union_commutative(a in arb_mask(), b in arb_mask()) {
            prop_assert_eq!(a.union(&b), b.union(&a));
        }

        #[test]
        fn overlaps_matches_intersection(a in arb_mask(), b in arb_mask()) {
            prop_assert_eq!(a.overlaps(&b), !a.intersection(&b).is_empty());
        }

        #[test]
        fn difference_disjoint_from_subtrahend(a in arb_mask(), b in arb_mask()) {
            let d = a.difference(&b);
            prop_assert!(!d.overlaps(&b));
            prop_assert!(d.is_subset(&a));
        }

        #[test]
        fn in_place_ops_match(a in arb_mask(), b in arb_mask()) {
            let mut u = a.clone();
            u.union_with(&b);
            prop_assert_eq!(u, a.union(&b));
            let mut s = a.clone();
            s.subtract(&b);
            prop_assert_eq!(s, a.difference(&b));
        }

        #[test]
        fn words_roundtrip(a in arb_mask()) {
            prop_assert_eq!(FieldMask::from_words(a.words()), a);
        }
    }
}
