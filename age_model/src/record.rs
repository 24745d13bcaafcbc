use std::cmp::Ordering;
use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::AgeModelError;

const RESERVED_KEYS: [&str; 2] = ["depth", "age"];

/// One sample of a section: stratigraphic depth, calibrated age, and any number of named proxies.
///
/// `depth` and `age` are typed fields; everything else lives in the open proxy map and is
/// flattened alongside them when serialized, e.g. `{"depth": 12.5, "age": 3.1, "d18O": 3.4}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    age: Option<f64>,
    #[serde(flatten)]
    proxies: BTreeMap<String, f64>,
}

impl ProxyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_depth(depth: f64) -> Self {
        Self {
            depth: Some(depth),
            ..Self::default()
        }
    }

    /// Builder form of [`ProxyRecord::insert_proxy`]; reserved keys are ignored.
    pub fn with_proxy(mut self, key: impl Into<String>, value: f64) -> Self {
        let _ = self.insert_proxy(key, value);
        self
    }

    pub fn depth(&self) -> Option<f64> {
        self.depth
    }

    pub fn age(&self) -> Option<f64> {
        self.age
    }

    pub(crate) fn set_age(&mut self, age: Option<f64>) {
        self.age = age;
    }

    pub fn proxy(&self, key: &str) -> Option<f64> {
        self.proxies.get(key).copied()
    }

    pub fn proxies(&self) -> &BTreeMap<String, f64> {
        &self.proxies
    }

    /// Sets a proxy measurement, returning the previous value. `depth` and `age` are rejected.
    pub fn insert_proxy(
        &mut self,
        key: impl Into<String>,
        value: f64,
    ) -> Result<Option<f64>, AgeModelError> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(AgeModelError::InvalidParameter(format!(
                "'{}' is a reserved record field, not a proxy",
                key
            )));
        }
        if !value.is_finite() {
            return Err(AgeModelError::NonFiniteValue(format!(
                "proxy '{}' = {}",
                key, value
            )));
        }
        Ok(self.proxies.insert(key, value))
    }

    /// Field-wise overwrite from `other`. Depth never changes.
    fn overwrite_from(&mut self, other: ProxyRecord) {
        if other.age.is_some() {
            self.age = other.age;
        }
        self.proxies.extend(other.proxies);
    }
}

/// Outcome of [`Section::merge_records`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub merged: usize,
    pub inserted: usize,
}

/// A depth interval of a core with its own proxy series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data_points: Vec<ProxyRecord>,
    /// Anything else the record store attached (core id, notes, timestamps). Passed through as-is.
    #[serde(flatten)]
    pub metadata: BTreeMap<String, JsonValue>,
}

impl Section {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data_points: Vec<ProxyRecord>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data_points,
            metadata: BTreeMap::new(),
        }
    }

    pub fn depths(&self) -> impl Iterator<Item = f64> + '_ {
        self.data_points.iter().filter_map(|r| r.depth)
    }

    pub fn has_ages(&self) -> bool {
        self.data_points.iter().any(|r| r.age.is_some())
    }

    /// Stable sort by depth; records without a depth go last in their original order.
    pub fn sort_by_depth(&mut self) {
        self.data_points.sort_by(|a, b| compare_depth(a.depth, b.depth));
    }

    /// Merges incoming records by depth: a record whose depth lies within `tolerance` of an
    /// existing one overwrites the nearest such record's fields; anything else is inserted in
    /// depth order. A non-finite incoming depth rejects the whole batch before anything changes.
    pub fn merge_records(
        &mut self,
        incoming: Vec<ProxyRecord>,
        tolerance: f64,
    ) -> Result<MergeSummary, AgeModelError> {
        if let Some(depth) = incoming
            .iter()
            .filter_map(|r| r.depth)
            .find(|d| !d.is_finite())
        {
            return Err(AgeModelError::NonFiniteValue(format!(
                "record depth {} in section '{}'",
                depth, self.id
            )));
        }
        let tolerance = if tolerance.is_finite() { tolerance.max(0.0) } else { 0.0 };
        self.sort_by_depth();

        // First record at each depth wins the index slot.
        let mut index: BTreeMap<OrderedFloat<f64>, usize> = BTreeMap::new();
        for (pos, record) in self.data_points.iter().enumerate() {
            if let Some(depth) = record.depth {
                index.entry(OrderedFloat(depth)).or_insert(pos);
            }
        }

        let mut summary = MergeSummary::default();
        for record in incoming {
            let Some(depth) = record.depth else {
                self.data_points.push(record);
                summary.inserted += 1;
                continue;
            };
            let nearest = index
                .range(OrderedFloat(depth - tolerance)..=OrderedFloat(depth + tolerance))
                .fold(None::<(f64, usize)>, |best, (key, &pos)| {
                    let gap = (key.0 - depth).abs();
                    match best {
                        Some((best_gap, _)) if best_gap <= gap => best,
                        _ => Some((gap, pos)),
                    }
                });
            match nearest {
                Some((_, pos)) => {
                    self.data_points[pos].overwrite_from(record);
                    summary.merged += 1;
                }
                None => {
                    index.insert(OrderedFloat(depth), self.data_points.len());
                    self.data_points.push(record);
                    summary.inserted += 1;
                }
            }
        }
        self.sort_by_depth();
        Ok(summary)
    }
}

fn compare_depth(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_json_shape() {
        let record = ProxyRecord::at_depth(12.5).with_proxy("d18O", 3.4);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"depth": 12.5, "d18O": 3.4}));

        let parsed: ProxyRecord =
            serde_json::from_value(serde_json::json!({"depth": 7, "age": 1.5, "mgca": 2.0}))
                .unwrap();
        assert_eq!(parsed.depth(), Some(7.0));
        assert_eq!(parsed.age(), Some(1.5));
        assert_eq!(parsed.proxy("mgca"), Some(2.0));
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let mut record = ProxyRecord::at_depth(1.0);
        assert!(record.insert_proxy("age", 5.0).is_err());
        assert!(record.insert_proxy("depth", 5.0).is_err());
        assert!(record.insert_proxy("d13C", f64::NAN).is_err());
        assert!(record.proxies().is_empty());
        assert_eq!(record.depth(), Some(1.0));
    }

    #[test]
    fn test_section_metadata_passthrough() {
        let json = serde_json::json!({
            "id": "s1",
            "name": "Section 1",
            "coreId": "c9",
            "dataPoints": [{"depth": 1.0, "tex86": 0.6}]
        });
        let section: Section = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(section.metadata.get("coreId"), Some(&serde_json::json!("c9")));
        assert_eq!(serde_json::to_value(&section).unwrap(), json);
    }

    #[test]
    fn test_merge_overwrites_matching_depth() {
        let mut section = Section::new(
            "s1",
            "S1",
            vec![
                ProxyRecord::at_depth(10.0).with_proxy("d18O", 3.0),
                ProxyRecord::at_depth(20.0).with_proxy("d18O", 3.5),
            ],
        );
        let summary = section
            .merge_records(
                vec![
                    ProxyRecord::at_depth(10.0).with_proxy("d18O", 3.1).with_proxy("mgca", 2.2),
                    ProxyRecord::at_depth(15.0).with_proxy("d18O", 3.3),
                ],
                0.0,
            )
            .unwrap();
        assert_eq!(summary, MergeSummary { merged: 1, inserted: 1 });
        let depths: Vec<f64> = section.depths().collect();
        assert_eq!(depths, vec![10.0, 15.0, 20.0]);
        assert_eq!(section.data_points[0].proxy("d18O"), Some(3.1));
        assert_eq!(section.data_points[0].proxy("mgca"), Some(2.2));
    }

    #[test]
    fn test_merge_tolerance() {
        let mut section = Section::new("s1", "S1", vec![ProxyRecord::at_depth(10.0)]);
        let exact = section
            .merge_records(vec![ProxyRecord::at_depth(10.0004)], 0.0)
            .unwrap();
        assert_eq!(exact.inserted, 1);

        let mut section = Section::new("s1", "S1", vec![ProxyRecord::at_depth(10.0)]);
        let loose = section
            .merge_records(
                vec![ProxyRecord::at_depth(10.0004).with_proxy("x", 1.0)],
                0.001,
            )
            .unwrap();
        assert_eq!(loose.merged, 1);
        assert_eq!(section.data_points.len(), 1);
        assert_eq!(section.data_points[0].depth(), Some(10.0));
    }

    #[test]
    fn test_depthless_records_sort_last() {
        let mut section = Section::new(
            "s1",
            "S1",
            vec![
                ProxyRecord::new().with_proxy("x", 1.0),
                ProxyRecord::at_depth(5.0),
                ProxyRecord::at_depth(2.0),
            ],
        );
        section.sort_by_depth();
        assert_eq!(section.data_points[0].depth(), Some(2.0));
        assert_eq!(section.data_points[1].depth(), Some(5.0));
        assert_eq!(section.data_points[2].depth(), None);
    }

    #[test]
    fn test_merge_rejects_non_finite_depth() {
        let mut section = Section::new("s1", "S1", vec![ProxyRecord::at_depth(1.0)]);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = section.merge_records(
                vec![ProxyRecord::at_depth(3.0), ProxyRecord::at_depth(bad)],
                0.0,
            );
            assert!(matches!(result, Err(AgeModelError::NonFiniteValue(_))));
        }
        let depths: Vec<f64> = section.depths().collect();
        assert_eq!(depths, vec![1.0]);
    }

    #[test]
    fn test_merge_picks_nearest_within_tolerance() {
        let mut section = Section::new(
            "s1",
            "S1",
            vec![ProxyRecord::at_depth(10.0), ProxyRecord::at_depth(11.0)],
        );
        let summary = section
            .merge_records(vec![ProxyRecord::at_depth(10.8).with_proxy("x", 1.0)], 1.0)
            .unwrap();
        assert_eq!(summary, MergeSummary { merged: 1, inserted: 0 });
        assert_eq!(section.data_points[0].proxy("x"), None);
        assert_eq!(section.data_points[1].proxy("x"), Some(1.0));
    }

    #[test]
    fn test_merge_large_unsorted_batch() {
        let n = 50_000usize;
        let incoming: Vec<ProxyRecord> = (0..n)
            .map(|i| {
                let depth = ((i * 7919) % n) as f64;
                ProxyRecord::at_depth(depth).with_proxy("d18O", depth / 10.0)
            })
            .collect();
        let mut section = Section::new("s1", "S1", Vec::new());
        let summary = section.merge_records(incoming.clone(), 0.0).unwrap();
        assert_eq!(summary, MergeSummary { merged: 0, inserted: n });
        let depths: Vec<f64> = section.depths().collect();
        assert!(depths.windows(2).all(|w| w[0] < w[1]));

        let again = section.merge_records(incoming, 0.0).unwrap();
        assert_eq!(again, MergeSummary { merged: n, inserted: 0 });
        assert_eq!(section.data_points.len(), n);
    }

    #[test]
    fn test_merge_later_duplicate_overwrites_earlier() {
        let mut section = Section::new("s1", "S1", Vec::new());
        let summary = section
            .merge_records(
                vec![
                    ProxyRecord::at_depth(5.0).with_proxy("x", 1.0),
                    ProxyRecord::at_depth(2.0),
                    ProxyRecord::at_depth(5.0).with_proxy("x", 2.0),
                ],
                0.0,
            )
            .unwrap();
        assert_eq!(summary, MergeSummary { merged: 1, inserted: 2 });
        assert_eq!(section.data_points[1].proxy("x"), Some(2.0));
    }
}
