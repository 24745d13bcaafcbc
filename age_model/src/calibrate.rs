use async_trait::async_trait;
use ordered_float::OrderedFloat;
use tracing::debug;

use crate::interpolate::{interpolate, AgeMap};
use crate::record::Section;
use crate::tie_points::{partition_anchors, TiePoint};
use crate::{AgeModelError, Params};

/// Calibrates every section with default [`Params`].
pub fn calibrate(sections: &[Section], tie_points: &[TiePoint]) -> Vec<Section> {
    calibrate_with(sections, tie_points, &Params::default())
}

/// Returns one new section per input section, in order, with each record's `age` set from the
/// section's tie-point model.
///
/// A record's age after calibration is exactly what this run computed for it: sections with
/// fewer than two usable tie-points, and records without a depth, come back with no age.
/// Nothing else about a section or its records changes.
pub fn calibrate_with(sections: &[Section], tie_points: &[TiePoint], params: &Params) -> Vec<Section> {
    let anchors = partition_anchors(tie_points);
    sections
        .iter()
        .map(|section| {
            let depths: Vec<f64> = section.depths().collect();
            let ages = anchors
                .get(section.id.as_str())
                .map(|a| interpolate(&depths, a))
                .unwrap_or_default();
            debug!(
                section = %section.id,
                records = section.data_points.len(),
                aged = ages.len(),
                "calibrated section"
            );
            apply_ages(section, &ages, params.age_decimals)
        })
        .collect()
}

/// Copies `section`, setting each record's age from `ages` by exact depth.
pub(crate) fn apply_ages(section: &Section, ages: &AgeMap, decimals: Option<u32>) -> Section {
    let mut out = section.clone();
    for record in &mut out.data_points {
        let age = record
            .depth()
            .and_then(|d| ages.get(&OrderedFloat(d)))
            .map(|&a| round_age(a, decimals));
        record.set_age(age);
    }
    out
}

fn round_age(age: f64, decimals: Option<u32>) -> f64 {
    match decimals {
        Some(places) => {
            let factor = 10f64.powi(places as i32);
            let scaled = age * factor;
            if scaled.is_finite() {
                scaled.round() / factor
            } else {
                age
            }
        }
        None => age,
    }
}

/// A way of producing calibrated sections: the local engine, or a delegate honoring the same
/// contract.
#[async_trait]
pub trait AgeModeler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn calibrate(
        &self,
        sections: &[Section],
        tie_points: &[TiePoint],
    ) -> Result<Vec<Section>, AgeModelError>;
}

/// The deterministic in-process engine.
#[derive(Clone, Debug, Default)]
pub struct LocalAgeModeler {
    pub params: Params,
}

impl LocalAgeModeler {
    pub fn new(params: Params) -> Self {
        Self { params }
    }
}

#[async_trait]
impl AgeModeler for LocalAgeModeler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn calibrate(
        &self,
        sections: &[Section],
        tie_points: &[TiePoint],
    ) -> Result<Vec<Section>, AgeModelError> {
        self.params.validate()?;
        Ok(calibrate_with(sections, tie_points, &self.params))
    }
}
