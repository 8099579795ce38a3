//! scan-estimate
//!
//! Photo measurement extraction. This is the only stage that recovers from
//! a failed model call: measurements then come from the user's last scan,
//! from the closest reference archetype, or from the declared body alone.

use super::vision::{AiError, AiErrorKind, PhotoInput, VisionRequest};
use super::{parse_gender, require_user_id};
use crate::db::scans::latest_scan_for_user;
use crate::error::ApiError;
use crate::pipeline::measurements::{BmiValidation, ScaleMethod};
use crate::pipeline::prompt::build_estimate_prompt;
use crate::pipeline::reply::{optional_number, parse_json_object};
use crate::pipeline::{enhance_measurements, DeclaredBody, EnhancedMeasurements, RawMeasurements, ReplyError};
use crate::AppState;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are an anthropometry assistant. You measure people from photos \
     and reply with strict JSON only.";

/// Girth change allowed when interpolating from a previous scan
const INTERPOLATION_MIN: f64 = 0.85;
const INTERPOLATION_MAX: f64 = 1.15;

/// BMI assumed for the archetype lookup when the declared one is unusable
const FALLBACK_LOOKUP_BMI: f64 = 22.0;

#[derive(Debug, Clone, Deserialize)]
pub struct EstimateRequest {
    pub user_id: String,
    #[serde(default)]
    pub photos: Vec<PhotoInput>,
    pub user_declared_height_cm: f64,
    pub user_declared_weight_kg: f64,
    pub user_declared_gender: String,
}

/// Where the measurements in a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    Vision,
    LastScan,
    DefaultArchetype,
    Neutral,
}

/// Final measurement values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementValues {
    pub chest_cm: f64,
    pub waist_cm: f64,
    pub hips_cm: f64,
    pub shoulder_width_cm: f64,
    pub hip_width_cm: f64,
    pub pixel_per_cm: f64,
}

impl From<&EnhancedMeasurements> for MeasurementValues {
    fn from(m: &EnhancedMeasurements) -> Self {
        Self {
            chest_cm: m.chest_cm,
            waist_cm: m.waist_cm,
            hips_cm: m.hips_cm,
            shoulder_width_cm: m.shoulder_width_cm,
            hip_width_cm: m.hip_width_cm,
            pixel_per_cm: m.pixel_per_cm,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedData {
    pub raw_measurements: MeasurementValues,
    pub estimated_bmi: f64,
    pub skin_tone: Option<Value>,
    pub keypoints: Value,
    pub scale_method: ScaleMethod,
    pub fallback_used: bool,
    pub bmi_validation: BmiValidation,
}

/// Failed model call, as reported back to the client
#[derive(Debug, Clone, Serialize)]
pub struct AiFailure {
    pub kind: AiErrorKind,
    pub message: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateDiagnostics {
    pub source: MeasurementSource,
    pub model_id: String,
    pub confidence: Option<f64>,
    pub fallback_fields: Vec<String>,
    pub processing_notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_error: Option<AiFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateResponse {
    pub extracted_data: ExtractedData,
    pub diagnostics: EstimateDiagnostics,
}

/// What the model reported
#[derive(Debug, Clone, PartialEq)]
pub struct VisionEstimate {
    pub raw: RawMeasurements,
    pub skin_tone: Option<Value>,
    pub keypoints: Value,
    pub confidence: Option<f64>,
}

/// Read the measurement extraction reply
///
/// Individual measurements are read leniently: anything that is not a
/// number counts as missing and is left to the enhancer.
pub fn parse_estimate_reply(text: &str) -> Result<VisionEstimate, ReplyError> {
    let obj = parse_json_object(text)?;
    let measurements = match obj.get("raw_measurements") {
        None | Some(Value::Null) => return Err(ReplyError::MissingField("raw_measurements".to_string())),
        Some(Value::Object(m)) => m,
        Some(_) => {
            return Err(ReplyError::WrongType {
                field: "raw_measurements".to_string(),
                expected: "an object",
            })
        }
    };

    let number = |key: &str| measurements.get(key).and_then(Value::as_f64);
    let raw = RawMeasurements {
        chest_cm: number("chest_cm"),
        waist_cm: number("waist_cm"),
        hips_cm: number("hips_cm"),
        shoulder_width_cm: number("shoulder_width_cm"),
        hip_width_cm: number("hip_width_cm"),
        pixel_per_cm: number("pixel_per_cm"),
        body_height_px: number("body_height_px"),
    };

    Ok(VisionEstimate {
        raw,
        skin_tone: obj.get("skin_tone").filter(|v| v.is_object()).cloned(),
        keypoints: obj.get("keypoints").filter(|v| v.is_array()).cloned().unwrap_or_else(|| json!([])),
        confidence: optional_number(&obj, "confidence")?.map(|c| c.clamp(0.0, 1.0)),
    })
}

/// Run the estimate stage
pub async fn run_estimate(state: &AppState, request: EstimateRequest) -> Result<EstimateResponse, ApiError> {
    require_user_id(&request.user_id)?;
    if request.photos.is_empty() {
        return Err(ApiError::BadRequest("photos: at least one photo is required".to_string()));
    }
    let gender = parse_gender("user_declared_gender", &request.user_declared_gender)?;
    let declared = DeclaredBody {
        height_cm: request.user_declared_height_cm,
        weight_kg: request.user_declared_weight_kg,
        gender,
    };

    let views: Vec<String> = request.photos.iter().map(|p| p.view.clone()).collect();
    let vision_request = VisionRequest::new(SYSTEM_PROMPT, build_estimate_prompt(&declared, &views), request.photos);

    let mut notes = Vec::new();
    let mut ai_error = None;
    let outcome = match state.vision.complete(&vision_request).await {
        Ok(text) => parse_estimate_reply(&text).map_err(|e| {
            warn!(user_id = %request.user_id, error = %e, "Estimate reply unusable");
            AiError::new(AiErrorKind::Format, e.to_string())
        }),
        Err(e) => Err(e),
    };

    let (estimate, source) = match outcome {
        Ok(estimate) => (estimate, MeasurementSource::Vision),
        Err(e) => {
            warn!(user_id = %request.user_id, kind = ?e.kind, "Estimate model call failed, using fallback measurements");
            notes.push(format!("vision unavailable ({:?}): {}", e.kind, e.detail));
            ai_error = Some(AiFailure {
                kind: e.kind,
                message: e.user_message().to_string(),
                detail: e.detail.clone(),
            });
            fallback_estimate(state, &request.user_id, &declared, &mut notes).await
        }
    };

    let enhanced = enhance_measurements(&estimate.raw, &declared, &mut notes);
    info!(
        user_id = %request.user_id,
        source = ?source,
        bmi = enhanced.estimated_bmi,
        fallback_fields = enhanced.fallback_fields.len(),
        "Measurements estimated"
    );

    Ok(EstimateResponse {
        extracted_data: ExtractedData {
            raw_measurements: MeasurementValues::from(&enhanced),
            estimated_bmi: enhanced.estimated_bmi,
            skin_tone: estimate.skin_tone,
            keypoints: estimate.keypoints,
            scale_method: enhanced.scale_method,
            fallback_used: source != MeasurementSource::Vision || enhanced.fallback_used(),
            bmi_validation: enhanced.bmi_validation.clone(),
        },
        diagnostics: EstimateDiagnostics {
            source,
            model_id: state.vision.model_id().to_string(),
            confidence: estimate.confidence,
            fallback_fields: enhanced.fallback_fields,
            processing_notes: notes,
            ai_error,
        },
    })
}

/// Last scan → nearest archetype → neutral
async fn fallback_estimate(
    state: &AppState,
    user_id: &str,
    declared: &DeclaredBody,
    notes: &mut Vec<String>,
) -> (VisionEstimate, MeasurementSource) {
    let bmi = Some(declared.bmi()).filter(|b| b.is_finite() && *b > 0.0);

    if state.settings.is_mock_user(user_id) {
        debug!(user_id, "Mock user, skipping last-scan lookup");
    } else {
        match latest_scan_for_user(&state.db, user_id).await {
            Ok(Some(scan)) => {
                let previous = scan
                    .raw_measurements
                    .clone()
                    .and_then(|v| serde_json::from_value::<RawMeasurements>(v).ok());
                if let Some(previous) = previous {
                    let raw = interpolate(&previous, scan.estimated_bmi, bmi);
                    notes.push(format!(
                        "measurements interpolated from scan {} (BMI {} -> {})",
                        scan.id,
                        fmt_bmi(scan.estimated_bmi),
                        fmt_bmi(bmi)
                    ));
                    return (
                        VisionEstimate {
                            raw,
                            skin_tone: scan.skin_tone,
                            keypoints: json!([]),
                            confidence: None,
                        },
                        MeasurementSource::LastScan,
                    );
                }
                debug!(user_id, scan_id = %scan.id, "Last scan has no usable measurements");
            }
            Ok(None) => debug!(user_id, "No previous scan"),
            Err(e) => warn!(user_id, error = %e, "Last-scan lookup failed"),
        }
    }

    match state
        .archetypes
        .nearest_by_bmi(declared.gender, bmi.unwrap_or(FALLBACK_LOOKUP_BMI))
        .await
    {
        Ok(Some(archetype)) => {
            if let Some(m) = archetype.measurements {
                notes.push(format!("measurements taken from reference archetype {}", archetype.id));
                let raw = RawMeasurements {
                    chest_cm: Some(m.chest_cm),
                    waist_cm: Some(m.waist_cm),
                    hips_cm: Some(m.hips_cm),
                    ..RawMeasurements::default()
                };
                return (
                    VisionEstimate {
                        raw,
                        skin_tone: None,
                        keypoints: json!([]),
                        confidence: None,
                    },
                    MeasurementSource::DefaultArchetype,
                );
            }
        }
        Ok(None) => debug!(gender = %declared.gender, "No reference archetype for fallback"),
        Err(e) => warn!(error = %e, "Reference archetype lookup failed"),
    }

    notes.push("measurements derived from declared body only".to_string());
    (
        VisionEstimate {
            raw: RawMeasurements::default(),
            skin_tone: None,
            keypoints: json!([]),
            confidence: None,
        },
        MeasurementSource::Neutral,
    )
}

/// Scale a previous scan's girths to the current BMI
///
/// Pixel scale is photo specific and never carried over.
fn interpolate(previous: &RawMeasurements, previous_bmi: Option<f64>, bmi: Option<f64>) -> RawMeasurements {
    let factor = match (previous_bmi, bmi) {
        (Some(then), Some(now)) if then > 0.0 => (now / then).sqrt().clamp(INTERPOLATION_MIN, INTERPOLATION_MAX),
        _ => 1.0,
    };
    let scale = |v: Option<f64>| v.map(|v| v * factor);
    RawMeasurements {
        chest_cm: scale(previous.chest_cm),
        waist_cm: scale(previous.waist_cm),
        hips_cm: scale(previous.hips_cm),
        shoulder_width_cm: previous.shoulder_width_cm,
        hip_width_cm: scale(previous.hip_width_cm),
        pixel_per_cm: None,
        body_height_px: None,
    }
}

fn fmt_bmi(bmi: Option<f64>) -> String {
    bmi.map(|b| format!("{:.1}", b)).unwrap_or_else(|| "N/A".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lenient_measurements() {
        let reply = r#"```json
        {"raw_measurements": {"chest_cm": 96.5, "waist_cm": "n/a", "pixel_per_cm": null},
         "skin_tone": {"r": 200, "g": 170, "b": 150}, "confidence": 1.4}
        ```"#;
        let parsed = parse_estimate_reply(reply).unwrap();
        assert_eq!(parsed.raw.chest_cm, Some(96.5));
        assert_eq!(parsed.raw.waist_cm, None);
        assert_eq!(parsed.raw.pixel_per_cm, None);
        assert_eq!(parsed.keypoints, json!([]));
        assert_eq!(parsed.confidence, Some(1.0));
        assert!(parsed.skin_tone.is_some());
    }

    #[test]
    fn test_missing_measurements_object() {
        let err = parse_estimate_reply(r#"{"skin_tone": null}"#).unwrap_err();
        assert_eq!(err.field(), Some("raw_measurements"));
    }

    #[test]
    fn test_interpolation_scales_girths_and_drops_scale() {
        let previous = RawMeasurements {
            chest_cm: Some(100.0),
            waist_cm: Some(80.0),
            hips_cm: Some(100.0),
            shoulder_width_cm: Some(44.0),
            hip_width_cm: Some(34.0),
            pixel_per_cm: Some(6.0),
            body_height_px: Some(1500.0),
        };
        let raw = interpolate(&previous, Some(25.0), Some(25.0 * 1.21));
        assert!((raw.waist_cm.unwrap() - 88.0).abs() < 1e-9);
        assert_eq!(raw.shoulder_width_cm, Some(44.0));
        assert_eq!(raw.pixel_per_cm, None);

        let capped = interpolate(&previous, Some(20.0), Some(40.0));
        assert!((capped.chest_cm.unwrap() - 115.0).abs() < 1e-9);

        let unknown = interpolate(&previous, None, Some(30.0));
        assert_eq!(unknown.chest_cm, Some(100.0));
    }
}
