//! Axis-aligned integer rectangles.

use std::fmt;

use smallvec::SmallVec;
use weft_core::Point;

/// Inclusive axis-aligned rectangle in an N-dimensional index space.
///
/// A rectangle with `lo[d] > hi[d]` in any dimension is empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Lower corner, inclusive.
    pub lo: Point,
    /// Upper corner, inclusive.
    pub hi: Point,
}

impl Rect {
    /// Rectangle from corners. Both corners must have the same dimension.
    pub fn new(lo: impl Into<Point>, hi: impl Into<Point>) -> Self {
        let (lo, hi) = (lo.into(), hi.into());
        debug_assert_eq!(lo.len(), hi.len(), "corner dimensions differ");
        Self { lo, hi }
    }

    /// One-dimensional rectangle `[lo, hi]`.
    pub fn line(lo: i64, hi: i64) -> Self {
        Self::new(SmallVec::from_slice(&[lo]), SmallVec::from_slice(&[hi]))
    }

    /// Rectangle containing the single point `p`.
    pub fn point(p: &[i64]) -> Self {
        Self::new(SmallVec::from_slice(p), SmallVec::from_slice(p))
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.lo.len()
    }

    /// Whether the rectangle contains no points.
    pub fn is_empty(&self) -> bool {
        self.lo.iter().zip(&self.hi).any(|(l, h)| l > h)
    }

    /// Number of points, saturating.
    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.lo
            .iter()
            .zip(&self.hi)
            .map(|(l, h)| (h - l) as u64 + 1)
            .fold(1u64, |acc, n| acc.saturating_mul(n))
    }

    /// Whether `p` lies inside.
    pub fn contains_point(&self, p: &[i64]) -> bool {
        p.len() == self.dim()
            && p
                .iter()
                .zip(self.lo.iter().zip(&self.hi))
                .all(|(x, (l, h))| l <= x && x <= h)
    }

    /// Whether `other` lies entirely inside. The empty rectangle lies in
    /// every rectangle.
    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (0..self.dim()).all(|d| self.lo[d] <= other.lo[d] && other.hi[d] <= self.hi[d])
    }

    /// Intersection; empty when disjoint.
    pub fn intersection(&self, other: &Rect) -> Rect {
        let lo = self.lo.iter().zip(&other.lo).map(|(a, b)| *a.max(b)).collect();
        let hi = self.hi.iter().zip(&other.hi).map(|(a, b)| *a.min(b)).collect();
        Rect { lo, hi }
    }

    /// Whether the two rectangles share a point.
    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Split along `dim` so that the upper half starts at `at`.
    ///
    /// `at` must lie in `(lo[dim], hi[dim]]`.
    pub fn split(&self, dim: usize, at: i64) -> (Rect, Rect) {
        debug_assert!(self.lo[dim] < at && at <= self.hi[dim]);
        let mut lower = self.clone();
        let mut upper = self.clone();
        lower.hi[dim] = at - 1;
        upper.lo[dim] = at;
        (lower, upper)
    }

    /// First cut that separates `self` from the part outside `target`.
    ///
    /// Returns `None` when `target` already covers `self`, or when they do
    /// not intersect.
    pub fn cut_toward(&self, target: &Rect) -> Option<(usize, i64)> {
        if !self.intersects(target) || target.contains(self) {
            return None;
        }
        for d in 0..self.dim() {
            if target.lo[d] > self.lo[d] {
                return Some((d, target.lo[d]));
            }
            if target.hi[d] < self.hi[d] {
                return Some((d, target.hi[d] + 1));
            }
        }
        None
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}..={:?}", self.lo.as_slice(), self.hi.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r2(lo: [i64; 2], hi: [i64; 2]) -> Rect {
        Rect::new(SmallVec::from_slice(&lo), SmallVec::from_slice(&hi))
    }

    #[test]
    fn volume_and_emptiness() {
        assert_eq!(r2([0, 0], [3, 1]).volume(), 8);
        assert!(r2([2, 0], [1, 5]).is_empty());
        assert_eq!(r2([2, 0], [1, 5]).volume(), 0);
    }

    #[test]
    fn intersection_of_disjoint_is_empty() {
        assert!(!Rect::line(0, 4).intersects(&Rect::line(5, 9)));
        assert_eq!(Rect::line(0, 6).intersection(&Rect::line(5, 9)), Rect::line(5, 6));
    }

    #[test]
    fn cut_toward_stops_when_covered() {
        let node = Rect::line(0, 99);
        assert_eq!(node.cut_toward(&Rect::line(10, 20)), Some((0, 10)));
        assert_eq!(Rect::line(10, 99).cut_toward(&Rect::line(10, 20)), Some((0, 21)));
        assert_eq!(Rect::line(10, 20).cut_toward(&Rect::line(10, 20)), None);
        assert_eq!(node.cut_toward(&Rect::line(200, 300)), None);
    }

    proptest! {
        #[test]
        fn split_partitions(lo in -50i64..50, len in 1i64..50, off in 1i64..50) {
            let r = Rect::line(lo, lo + len);
            let at = lo + (off % len).max(1);
            let (a, b) = r.split(0, at);
            prop_assert_eq!(a.volume() + b.volume(), r.volume());
            prop_assert!(!a.intersects(&b));
            prop_assert!(r.contains(&a) && r.contains(&b));
        }

        #[test]
        fn repeated_cuts_converge(
            lo in 0i64..20,
            hi in 20i64..40,
            qlo in 0i64..40,
            qlen in 0i64..40,
        ) {
            let mut node = Rect::line(lo, hi);
            let target = Rect::line(qlo, qlo + qlen);
            let mut steps = 0;
            while let Some((d, at)) = node.cut_toward(&target) {
                let (a, b) = node.split(d, at);
                node = if a.intersects(&target) { a } else { b };
                steps += 1;
                prop_assert!(steps <= 2);
            }
            prop_assert!(!node.intersects(&target) || target.contains(&node));
        }
    }
}
