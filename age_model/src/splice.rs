//! Splice windows and composite assembly.
//!
//! Each calibrated section contributes the records whose age falls inside its configured
//! window; the contributions are concatenated and ordered by age. The composite is a derived
//! view with no state of its own and is rebuilt from scratch on every change.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::record::{ProxyRecord, Section};
use crate::AgeModelError;

/// Age window for one section. Either bound may be unset, which leaves the section out of the
/// composite. Bounds may be entered in either order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpliceInterval {
    #[serde(default)]
    pub start_age: Option<f64>,
    #[serde(default)]
    pub end_age: Option<f64>,
}

impl SpliceInterval {
    pub fn new(start_age: Option<f64>, end_age: Option<f64>) -> Self {
        Self { start_age, end_age }
    }

    /// `(lo, hi)` once both bounds are set.
    pub fn window(&self) -> Option<(f64, f64)> {
        match (self.start_age, self.end_age) {
            (Some(a), Some(b)) => Some((a.min(b), a.max(b))),
            _ => None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.window().is_some()
    }

    pub fn contains(&self, age: f64) -> bool {
        self.window()
            .map(|(lo, hi)| lo <= age && age <= hi)
            .unwrap_or(false)
    }
}

/// Splice windows keyed by section id.
pub type SpliceIntervals = BTreeMap<String, SpliceInterval>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalBound {
    Start,
    End,
}

impl FromStr for IntervalBound {
    type Err = AgeModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "startage" | "start_age" => Ok(IntervalBound::Start),
            "end" | "endage" | "end_age" => Ok(IntervalBound::End),
            other => Err(AgeModelError::InvalidInterval(format!(
                "unknown bound '{}': expected start or end",
                other
            ))),
        }
    }
}

/// Updates one bound of a section's window from user text. Blank text clears the bound.
///
/// No ordering check is made between the bounds. Text that is not a finite number is rejected
/// and the window is left untouched.
pub fn set_interval(
    intervals: &mut SpliceIntervals,
    section_id: &str,
    field: IntervalBound,
    raw: &str,
) -> Result<SpliceInterval, AgeModelError> {
    let trimmed = raw.trim();
    let value = if trimmed.is_empty() {
        None
    } else {
        let parsed: f64 = trimmed.parse().map_err(|_| {
            AgeModelError::InvalidInterval(format!("'{}' is not a number", trimmed))
        })?;
        if !parsed.is_finite() {
            return Err(AgeModelError::InvalidInterval(format!(
                "'{}' is not a finite age",
                trimmed
            )));
        }
        Some(parsed)
    };
    let interval = intervals.entry(section_id.to_string()).or_default();
    match field {
        IntervalBound::Start => interval.start_age = value,
        IntervalBound::End => interval.end_age = value,
    }
    Ok(*interval)
}

/// One composite record and the section it came from. The age is held on the point itself, so
/// `record` carries only depth and proxies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositePoint {
    pub section_id: String,
    pub age: f64,
    #[serde(flatten)]
    pub record: ProxyRecord,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeSeries {
    pub points: Vec<CompositePoint>,
}

impl CompositeSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn ages(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.age).collect()
    }

    pub fn age_span(&self) -> Option<(f64, f64)> {
        Some((self.points.first()?.age, self.points.last()?.age))
    }

    /// Sorted union of proxy names across all points.
    pub fn proxy_keys(&self) -> Vec<String> {
        let keys: BTreeSet<&String> = self
            .points
            .iter()
            .flat_map(|p| p.record.proxies().keys())
            .collect();
        keys.into_iter().cloned().collect()
    }
}

/// Builds the age-ordered composite from calibrated sections and their windows.
///
/// `None` means calibration has not run yet and yields an empty series. Ties in age keep the
/// order in which sections and records were supplied.
pub fn assemble(calibrated: Option<&[Section]>, intervals: &SpliceIntervals) -> CompositeSeries {
    let Some(sections) = calibrated else {
        return CompositeSeries::default();
    };
    let mut points = Vec::new();
    for section in sections {
        let Some(interval) = intervals.get(&section.id) else {
            continue;
        };
        if !interval.is_configured() {
            continue;
        }
        for record in &section.data_points {
            let Some(age) = record.age() else {
                continue;
            };
            if interval.contains(age) {
                let mut record = record.clone();
                record.set_age(None);
                points.push(CompositePoint {
                    section_id: section.id.clone(),
                    age,
                    record,
                });
            }
        }
    }
    points.sort_by(|a, b| a.age.total_cmp(&b.age));
    CompositeSeries { points }
}

/// Two configured windows sharing part of their age range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpliceOverlap {
    pub first: String,
    pub second: String,
    pub from_age: f64,
    pub to_age: f64,
}

/// Pairs of configured windows whose ranges intersect, ordered by section id.
pub fn overlaps(intervals: &SpliceIntervals) -> Vec<SpliceOverlap> {
    let windows: Vec<(&String, (f64, f64))> = intervals
        .iter()
        .filter_map(|(id, interval)| interval.window().map(|w| (id, w)))
        .collect();
    let mut out = Vec::new();
    for (i, (first, (lo1, hi1))) in windows.iter().enumerate() {
        for (second, (lo2, hi2)) in &windows[i + 1..] {
            let from_age = lo1.max(*lo2);
            let to_age = hi1.min(*hi2);
            if from_age <= to_age {
                out.push(SpliceOverlap {
                    first: (*first).clone(),
                    second: (*second).clone(),
                    from_age,
                    to_age,
                });
            }
        }
    }
    out
}
