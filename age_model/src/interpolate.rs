//! Piecewise linear depth→age model built from tie-points.
//!
//! Between two tie-points the age is interpolated linearly; above the shallowest or below the
//! deepest tie-point the line through the two outermost anchors on that side is extended. A
//! model needs at least two anchors at distinct depths; with fewer, no depth receives an age.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Depth → age, keyed on the exact depth value that was looked up.
pub type AgeMap = HashMap<OrderedFloat<f64>, f64>;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub depth: f64,
    pub age: f64,
}

impl Anchor {
    pub fn new(depth: f64, age: f64) -> Self {
        Self { depth, age }
    }
}

/// Anchors sorted by depth, unique and finite, at least two of them.
#[derive(Clone, Debug, PartialEq)]
pub struct AgeModel {
    anchors: Vec<Anchor>,
}

impl AgeModel {
    /// Builds a model, or `None` when fewer than two usable anchors remain.
    ///
    /// Non-finite anchors are dropped. When several anchors share a depth the first one supplied
    /// is kept and the rest are dropped.
    pub fn from_anchors(anchors: &[Anchor]) -> Option<Self> {
        let mut sorted: Vec<Anchor> = anchors
            .iter()
            .copied()
            .filter(|a| a.depth.is_finite() && a.age.is_finite())
            .collect();
        if sorted.len() < anchors.len() {
            warn!(
                dropped = anchors.len() - sorted.len(),
                "ignoring non-finite tie-points"
            );
        }
        sorted.sort_by(|a, b| a.depth.total_cmp(&b.depth));
        let before = sorted.len();
        sorted.dedup_by(|later, earlier| later.depth == earlier.depth);
        if sorted.len() < before {
            warn!(
                dropped = before - sorted.len(),
                "tie-points share a depth; keeping the first at each depth"
            );
        }
        if sorted.len() < 2 {
            return None;
        }
        Some(Self { anchors: sorted })
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn age_at(&self, depth: f64) -> f64 {
        let n = self.anchors.len();
        let upper = self.anchors.partition_point(|a| a.depth <= depth);
        let (lo, hi) = if upper == 0 {
            (0, 1)
        } else if upper >= n {
            (n - 2, n - 1)
        } else {
            (upper - 1, upper)
        };
        along_segment(self.anchors[lo], self.anchors[hi], depth)
    }
}

fn along_segment(a0: Anchor, a1: Anchor, depth: f64) -> f64 {
    let span = a1.depth - a0.depth;
    if span == 0.0 {
        return a0.age;
    }
    a0.age + (a1.age - a0.age) * (depth - a0.depth) / span
}

/// Ages for every finite depth, or an empty map when the anchors do not form a model.
pub fn interpolate(depths: &[f64], anchors: &[Anchor]) -> AgeMap {
    let Some(model) = AgeModel::from_anchors(anchors) else {
        return AgeMap::new();
    };
    depths
        .iter()
        .copied()
        .filter(|d| d.is_finite())
        .map(|d| (OrderedFloat(d), model.age_at(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchors(pairs: &[(f64, f64)]) -> Vec<Anchor> {
        pairs.iter().map(|&(d, a)| Anchor::new(d, a)).collect()
    }

    fn age(map: &AgeMap, depth: f64) -> Option<f64> {
        map.get(&OrderedFloat(depth)).copied()
    }

    #[test]
    fn test_fewer_than_two_anchors() {
        assert!(interpolate(&[1.0, 2.0], &[]).is_empty());
        assert!(interpolate(&[1.0, 2.0], &anchors(&[(1.0, 10.0)])).is_empty());
    }

    #[test]
    fn test_interpolation_between_anchors() {
        let map = interpolate(&[15.0], &anchors(&[(10.0, 100.0), (20.0, 200.0)]));
        assert_eq!(age(&map, 15.0), Some(150.0));
    }

    #[test]
    fn test_extrapolation_both_ends() {
        let map = interpolate(&[5.0, 30.0], &anchors(&[(20.0, 200.0), (10.0, 100.0)]));
        assert_eq!(age(&map, 5.0), Some(50.0));
        assert_eq!(age(&map, 30.0), Some(300.0));
    }

    #[test]
    fn test_innermost_bracketing_pair() {
        // Slope changes at depth 10: 1 yr/cm above, 10 yr/cm below.
        let pts = anchors(&[(0.0, 0.0), (10.0, 10.0), (20.0, 110.0)]);
        let map = interpolate(&[5.0, 10.0, 15.0, 25.0, -5.0], &pts);
        assert_eq!(age(&map, 5.0), Some(5.0));
        assert_eq!(age(&map, 10.0), Some(10.0));
        assert_eq!(age(&map, 15.0), Some(60.0));
        assert_eq!(age(&map, 25.0), Some(160.0));
        assert_eq!(age(&map, -5.0), Some(-5.0));
    }

    #[test]
    fn test_exact_anchor_depths() {
        let pts = anchors(&[(0.0, 0.0), (100.0, 10.0)]);
        let map = interpolate(&[0.0, 50.0, 100.0], &pts);
        assert_eq!(age(&map, 0.0), Some(0.0));
        assert_eq!(age(&map, 50.0), Some(5.0));
        assert_eq!(age(&map, 100.0), Some(10.0));
    }

    #[test]
    fn test_duplicate_depth_keeps_first() {
        let pts = anchors(&[(10.0, 100.0), (10.0, 999.0), (20.0, 200.0)]);
        let model = AgeModel::from_anchors(&pts).unwrap();
        assert_eq!(model.anchors().len(), 2);
        assert_eq!(model.age_at(10.0), 100.0);
        assert_eq!(model.age_at(15.0), 150.0);
    }

    #[test]
    fn test_duplicates_only_is_not_a_model() {
        let pts = anchors(&[(10.0, 100.0), (10.0, 200.0)]);
        assert!(AgeModel::from_anchors(&pts).is_none());
        assert!(interpolate(&[10.0], &pts).is_empty());
    }

    #[test]
    fn test_non_finite_inputs_skipped() {
        let pts = anchors(&[(0.0, 0.0), (f64::NAN, 3.0), (10.0, 1.0)]);
        let map = interpolate(&[5.0, f64::INFINITY], &pts);
        assert_eq!(map.len(), 1);
        assert_eq!(age(&map, 5.0), Some(0.5));
    }

    #[test]
    fn test_zero_span_segment() {
        let a = Anchor::new(3.0, 7.0);
        assert_eq!(along_segment(a, a, 3.0), 7.0);
    }
}
