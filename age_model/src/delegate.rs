//! Remote age modeling through a generative JSON service.
//!
//! The service sees only depths and tie-points. Its answer is checked against the local
//! engine's rules before anything is merged: every section must come back exactly once, ages
//! must be numeric, and a section without a two-anchor model must not receive ages. Only the
//! `age` field is ever taken from the response, and it is joined onto the original records by
//! depth. Any violation fails the whole call.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::calibrate::{apply_ages, AgeModeler};
use crate::interpolate::{AgeMap, AgeModel};
use crate::record::Section;
use crate::tie_points::{partition_anchors, TiePoint};
use crate::{AgeModelError, Params};

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

const CALIBRATION_PROMPT: &str = "You are an age-depth modeling assistant for sediment cores. \
For every section in the payload, compute an age for each data point depth by linear \
interpolation between the section's tie-points (sorted by depth), extrapolating linearly \
beyond the shallowest and deepest tie-points using the two nearest tie-points. A section with \
fewer than two tie-points gets no ages: omit `age` for its data points. Return JSON of the form \
{\"calibratedSections\": [{\"id\": string, \"dataPoints\": [{\"depth\": number, \"age\": number}]}]} \
containing every section id from the payload exactly once.";

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("network error: {0}")]
    Network(String),
    #[error("service returned {0}: {1}")]
    Api(u16, String),
    #[error("unparseable response: {0}")]
    Parse(String),
    #[error("response is missing section '{0}'")]
    MissingSection(String),
    #[error("response contains unknown or repeated section '{0}'")]
    UnknownSection(String),
    #[error("response assigns ages to section '{0}', which has fewer than two tie-points")]
    InventedAges(String),
    #[error("non-numeric age in section '{0}'")]
    NonNumericAge(String),
    #[error("delegate unavailable: {0}")]
    Unavailable(String),
}

/// Connection settings for the generative service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// A black-box service that answers a prompt plus JSON payload with a JSON object.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn generate_json(
        &self,
        prompt: &str,
        payload: &JsonValue,
    ) -> Result<JsonValue, DelegateError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepthOnly {
    pub depth: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateSection {
    pub id: String,
    pub name: String,
    pub data_points: Vec<DepthOnly>,
}

/// What the service is sent: a depth-only projection of each section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateRequest {
    pub sections: Vec<DelegateSection>,
    pub tie_points: Vec<TiePoint>,
}

impl DelegateRequest {
    pub fn project(sections: &[Section], tie_points: &[TiePoint]) -> Self {
        Self {
            sections: sections
                .iter()
                .map(|s| DelegateSection {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    data_points: s.depths().map(|depth| DepthOnly { depth }).collect(),
                })
                .collect(),
            tie_points: tie_points.to_vec(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DelegatePoint {
    pub depth: f64,
    #[serde(default)]
    pub age: Option<JsonValue>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateCalibratedSection {
    pub id: String,
    #[serde(default)]
    pub data_points: Vec<DelegatePoint>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateResponse {
    pub calibrated_sections: Vec<DelegateCalibratedSection>,
}

/// Checks a response against the sections it answers and returns the ages per section id.
pub fn validate_response(
    sections: &[Section],
    tie_points: &[TiePoint],
    response: DelegateResponse,
) -> Result<HashMap<String, AgeMap>, DelegateError> {
    let expected: HashSet<&str> = sections.iter().map(|s| s.id.as_str()).collect();
    let anchors = partition_anchors(tie_points);
    let mut out: HashMap<String, AgeMap> = HashMap::with_capacity(sections.len());

    for section in response.calibrated_sections {
        if !expected.contains(section.id.as_str()) || out.contains_key(&section.id) {
            return Err(DelegateError::UnknownSection(section.id));
        }
        let modeled = anchors
            .get(section.id.as_str())
            .and_then(|a| AgeModel::from_anchors(a))
            .is_some();
        let mut ages = AgeMap::new();
        for point in section.data_points {
            let age = match point.age {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::Number(n)) => n
                    .as_f64()
                    .filter(|a| a.is_finite())
                    .ok_or_else(|| DelegateError::NonNumericAge(section.id.clone()))?,
                Some(_) => return Err(DelegateError::NonNumericAge(section.id.clone())),
            };
            if !modeled {
                return Err(DelegateError::InventedAges(section.id.clone()));
            }
            ages.insert(OrderedFloat(point.depth), age);
        }
        out.insert(section.id, ages);
    }

    for section in sections {
        if !out.contains_key(&section.id) {
            return Err(DelegateError::MissingSection(section.id.clone()));
        }
    }
    Ok(out)
}

/// Calibration through a [`GenerativeClient`], validated and merged locally.
pub struct RemoteAgeModeler<C: GenerativeClient> {
    client: C,
    params: Params,
}

impl<C: GenerativeClient> RemoteAgeModeler<C> {
    pub fn new(client: C, params: Params) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl<C: GenerativeClient> AgeModeler for RemoteAgeModeler<C> {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn calibrate(
        &self,
        sections: &[Section],
        tie_points: &[TiePoint],
    ) -> Result<Vec<Section>, AgeModelError> {
        self.params.validate()?;
        let request = DelegateRequest::project(sections, tie_points);
        let payload =
            serde_json::to_value(&request).map_err(|e| DelegateError::Parse(e.to_string()))?;
        debug!(
            sections = request.sections.len(),
            tie_points = request.tie_points.len(),
            "sending calibration request"
        );

        let raw = self.client.generate_json(CALIBRATION_PROMPT, &payload).await?;
        let response: DelegateResponse =
            serde_json::from_value(raw).map_err(|e| DelegateError::Parse(e.to_string()))?;
        let mut ages = validate_response(sections, tie_points, response)?;

        let calibrated: Vec<Section> = sections
            .iter()
            .map(|s| {
                let section_ages = ages.remove(&s.id).unwrap_or_default();
                apply_ages(s, &section_ages, self.params.age_decimals)
            })
            .collect();
        info!(sections = calibrated.len(), "remote calibration accepted");
        Ok(calibrated)
    }
}

#[cfg(feature = "http")]
pub use http::HttpGenerativeClient;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};

    use super::{DelegateConfig, DelegateError, GenerativeClient};

    const USER_AGENT: &str = concat!("age-model/", env!("CARGO_PKG_VERSION"));

    /// `generateContent`-style HTTP client requesting a JSON response.
    pub struct HttpGenerativeClient {
        http_client: reqwest::Client,
        config: DelegateConfig,
    }

    impl HttpGenerativeClient {
        pub fn new(config: DelegateConfig) -> Result<Self, DelegateError> {
            let http_client = reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .timeout(Duration::from_secs(config.timeout_secs.max(1)))
                .build()
                .map_err(|e| DelegateError::Network(e.to_string()))?;
            Ok(Self {
                http_client,
                config,
            })
        }
    }

    #[async_trait]
    impl GenerativeClient for HttpGenerativeClient {
        async fn generate_json(
            &self,
            prompt: &str,
            payload: &JsonValue,
        ) -> Result<JsonValue, DelegateError> {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| DelegateError::Unavailable("no API key configured".into()))?;
            let url = format!(
                "{}/models/{}:generateContent",
                self.config.endpoint.trim_end_matches('/'),
                self.config.model
            );
            let body = json!({
                "contents": [{
                    "parts": [
                        { "text": prompt },
                        { "text": payload.to_string() }
                    ]
                }],
                "generationConfig": { "responseMimeType": "application/json" }
            });

            tracing::debug!(url = %url, "calling generative service");
            let response = self
                .http_client
                .post(&url)
                .query(&[("key", api_key)])
                .json(&body)
                .send()
                .await
                .map_err(|e| DelegateError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                return Err(DelegateError::Api(status.as_u16(), error_text));
            }

            let envelope: JsonValue = response
                .json()
                .await
                .map_err(|e| DelegateError::Parse(e.to_string()))?;
            let text = envelope
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| DelegateError::Parse("response has no candidate text".into()))?;
            super::parse_json_text(text)
        }
    }
}

/// Parses model output as JSON, tolerating a surrounding markdown code fence.
#[cfg(any(feature = "http", test))]
pub(crate) fn parse_json_text(text: &str) -> Result<JsonValue, DelegateError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| DelegateError::Parse(e.to_string()))
}
