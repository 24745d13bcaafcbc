use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::interpolate::Anchor;
use crate::AgeModelError;

/// A user-asserted depth/age correspondence for one section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiePoint {
    pub section_id: String,
    pub depth: f64,
    pub age: f64,
}

impl TiePoint {
    pub fn new(section_id: impl Into<String>, depth: f64, age: f64) -> Self {
        Self {
            section_id: section_id.into(),
            depth,
            age,
        }
    }

    pub fn anchor(&self) -> Anchor {
        Anchor {
            depth: self.depth,
            age: self.age,
        }
    }
}

/// All tie-points of a core.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TiePointSet {
    points: Vec<TiePoint>,
}

impl TiePointSet {
    pub fn new(points: Vec<TiePoint>) -> Self {
        Self { points }
    }

    pub fn as_slice(&self) -> &[TiePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: TiePoint) {
        self.points.push(point);
    }

    /// Tie-points of one section, in the order they were supplied.
    pub fn for_section(&self, section_id: &str) -> Vec<&TiePoint> {
        self.points
            .iter()
            .filter(|p| p.section_id == section_id)
            .collect()
    }

    /// Anchors grouped by section id, in the order they were supplied.
    pub fn partition(&self) -> HashMap<&str, Vec<Anchor>> {
        partition_anchors(&self.points)
    }

    /// Sections holding at least two tie-points at distinct finite depths.
    pub fn section_ids_with_model(&self) -> Vec<String> {
        let mut depths: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for point in self.points.iter().filter(|p| p.depth.is_finite() && p.age.is_finite()) {
            let entry = depths.entry(point.section_id.as_str()).or_default();
            if !entry.contains(&point.depth) {
                entry.push(point.depth);
            }
        }
        depths
            .into_iter()
            .filter(|(_, d)| d.len() >= 2)
            .map(|(id, _)| id.to_string())
            .collect()
    }

    /// Rejects non-finite values and two tie-points sharing a depth within one section.
    pub fn validate(&self) -> Result<(), AgeModelError> {
        let mut seen: HashMap<&str, Vec<f64>> = HashMap::new();
        for point in &self.points {
            if !point.depth.is_finite() || !point.age.is_finite() {
                return Err(AgeModelError::NonFiniteValue(format!(
                    "tie-point in section '{}' (depth {}, age {})",
                    point.section_id, point.depth, point.age
                )));
            }
            let depths = seen.entry(point.section_id.as_str()).or_default();
            if depths.contains(&point.depth) {
                return Err(AgeModelError::DegenerateTiePoints {
                    section_id: point.section_id.clone(),
                    depth: point.depth,
                });
            }
            depths.push(point.depth);
        }
        Ok(())
    }
}

impl From<Vec<TiePoint>> for TiePointSet {
    fn from(points: Vec<TiePoint>) -> Self {
        Self::new(points)
    }
}

pub(crate) fn partition_anchors(points: &[TiePoint]) -> HashMap<&str, Vec<Anchor>> {
    let mut out: HashMap<&str, Vec<Anchor>> = HashMap::new();
    for point in points {
        out.entry(point.section_id.as_str())
            .or_default()
            .push(point.anchor());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_by_section() {
        let set = TiePointSet::new(vec![
            TiePoint::new("a", 0.0, 0.0),
            TiePoint::new("b", 5.0, 1.0),
            TiePoint::new("a", 10.0, 2.0),
        ]);
        let parts = set.partition();
        assert_eq!(parts["a"].len(), 2);
        assert_eq!(parts["b"].len(), 1);
        let a: Vec<f64> = set.for_section("a").iter().map(|p| p.depth).collect();
        assert_eq!(a, vec![0.0, 10.0]);
        assert!(set.for_section("missing").is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicate_depth() {
        let set = TiePointSet::new(vec![
            TiePoint::new("a", 10.0, 1.0),
            TiePoint::new("b", 10.0, 1.0),
            TiePoint::new("a", 10.0, 2.0),
        ]);
        match set.validate() {
            Err(AgeModelError::DegenerateTiePoints { section_id, depth }) => {
                assert_eq!(section_id, "a");
                assert_eq!(depth, 10.0);
            }
            other => panic!("expected degenerate tie-points, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let set = TiePointSet::new(vec![TiePoint::new("a", f64::NAN, 1.0)]);
        assert!(matches!(set.validate(), Err(AgeModelError::NonFiniteValue(_))));
    }

    #[test]
    fn test_sections_with_model() {
        let set = TiePointSet::new(vec![
            TiePoint::new("a", 0.0, 0.0),
            TiePoint::new("a", 10.0, 2.0),
            TiePoint::new("b", 3.0, 1.0),
            TiePoint::new("c", 3.0, 1.0),
            TiePoint::new("c", 3.0, 4.0),
        ]);
        assert_eq!(set.section_ids_with_model(), vec!["a".to_string()]);
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(TiePointSet::new(vec![TiePoint::new("a", 1.0, 2.0)]))
            .unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"sectionId": "a", "depth": 1.0, "age": 2.0}])
        );
    }
}
