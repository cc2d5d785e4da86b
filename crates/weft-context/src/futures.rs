//! Future maps of index-space launches.

use std::collections::BTreeMap;

use weft_core::{Event, Point};
use weft_eqset::Rect;
use weft_pipeline::Future;

/// Futures of an index launch, keyed by launch point.
#[derive(Clone, Debug, Default)]
pub struct FutureMap {
    futures: BTreeMap<Point, Future>,
}

impl FutureMap {
    /// Pending futures for `points`.
    pub fn pending<I>(points: I) -> Self
    where
        I: IntoIterator<Item = Point>,
    {
        Self {
            futures: points.into_iter().map(|p| (p, Future::pending())).collect(),
        }
    }

    /// Future of `point`, if the point belongs to this map.
    pub fn get(&self, point: &[i64]) -> Option<&Future> {
        self.futures.get(point)
    }

    /// Points of the map, in lexicographic order.
    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.futures.keys()
    }

    /// Point and future pairs, in lexicographic point order.
    pub fn iter(&self) -> impl Iterator<Item = (&Point, &Future)> {
        self.futures.iter()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// Whether the map has no points.
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// Triggers once every future is ready.
    pub fn all_ready(&self) -> Event {
        Event::merge(self.futures.values().map(Future::ready_event))
    }
}

/// Every point of `rect` in row-major order (last dimension fastest).
pub fn rect_points(rect: &Rect) -> Vec<Point> {
    if rect.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(rect.volume().min(1 << 20) as usize);
    let mut p = rect.lo.clone();
    loop {
        out.push(p.clone());
        let mut d = rect.dim();
        loop {
            if d == 0 {
                return out;
            }
            d -= 1;
            if p[d] < rect.hi[d] {
                p[d] += 1;
                break;
            }
            p[d] = rect.lo[d];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn points_are_row_major() {
        let lo: Point = smallvec![0, 0];
        let hi: Point = smallvec![1, 2];
        let pts = rect_points(&Rect::new(lo, hi));
        let flat: Vec<Vec<i64>> = pts.iter().map(|p| p.to_vec()).collect();
        assert_eq!(
            flat,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert!(rect_points(&Rect::line(3, 2)).is_empty());
    }

    #[test]
    fn map_is_ready_once_every_point_is() {
        let fm = FutureMap::pending(rect_points(&Rect::line(0, 2)));
        assert_eq!(fm.len(), 3);
        let ready = fm.all_ready();
        fm.get(&[0]).unwrap().set(vec![1]);
        fm.get(&[1]).unwrap().set(vec![2]);
        assert!(!ready.has_triggered());
        fm.get(&[2]).unwrap().set(vec![3]);
        assert!(ready.has_triggered());
        assert!(fm.get(&[3]).is_none());
    }
}
