//! Age-depth model calibration and composite splice assembly for sediment core sections.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod calibrate;
pub mod delegate;
pub mod interpolate;
pub mod record;
pub mod splice;
pub mod tie_points;

pub use calibrate::{calibrate, calibrate_with, AgeModeler, LocalAgeModeler};
pub use delegate::{DelegateConfig, DelegateError, GenerativeClient, RemoteAgeModeler};
#[cfg(feature = "http")]
pub use delegate::HttpGenerativeClient;
pub use interpolate::{interpolate, AgeMap, AgeModel, Anchor};
pub use record::{MergeSummary, ProxyRecord, Section};
pub use splice::{
    assemble, overlaps, set_interval, CompositePoint, CompositeSeries, IntervalBound,
    SpliceInterval, SpliceIntervals, SpliceOverlap,
};
pub use tie_points::{TiePoint, TiePointSet};

#[derive(Error, Debug)]
pub enum AgeModelError {
    #[error("duplicate tie-point depth {depth} in section '{section_id}'")]
    DegenerateTiePoints { section_id: String, depth: f64 },
    #[error("non-finite value: {0}")]
    NonFiniteValue(String),
    #[error("invalid splice bound: {0}")]
    InvalidInterval(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("calibration delegate failed: {0}")]
    Delegate(#[from] DelegateError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    /// Decimal places kept when ages are merged back onto records; `None` keeps full precision.
    pub age_decimals: Option<u32>,
    /// Absolute tolerance for treating two record depths as the same sample.
    pub depth_tolerance: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            age_decimals: Some(4),
            depth_tolerance: 0.0,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), AgeModelError> {
        if !self.depth_tolerance.is_finite() || self.depth_tolerance < 0.0 {
            return Err(AgeModelError::InvalidParameter(format!(
                "depth tolerance must be a non-negative number, got {}",
                self.depth_tolerance
            )));
        }
        if let Some(decimals) = self.age_decimals {
            if decimals > 12 {
                return Err(AgeModelError::InvalidParameter(format!(
                    "age decimals must be at most 12, got {}",
                    decimals
                )));
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintInput<'a> {
    sections: &'a [Section],
    tie_points: &'a [TiePoint],
    params: &'a Params,
}

/// SHA-256 over the canonical JSON of everything calibration depends on.
pub fn calibration_fingerprint(
    sections: &[Section],
    tie_points: &[TiePoint],
    params: &Params,
) -> Result<String, AgeModelError> {
    let input = FingerprintInput {
        sections,
        tie_points,
        params,
    };
    let bytes =
        serde_json::to_vec(&input).map_err(|e| AgeModelError::InvalidParameter(e.to_string()))?;
    Ok(sha256_hex(&bytes))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
