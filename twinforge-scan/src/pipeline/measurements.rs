//! Measurement enhancement
//!
//! Fills photo-derived measurements that the vision model could not provide
//! with closed-form fallbacks from the declared height, weight and gender,
//! then enforces the girth ordering invariants. Every substitution or
//! correction is written to the caller's notes list.

use serde::{Deserialize, Serialize};
use twinforge_common::Gender;

/// Reference BMI used to scale baseline girths
const REFERENCE_BMI: f64 = 22.0;

/// Scale factor applied to baselines is kept within this range
const BMI_RATIO_MIN: f64 = 0.8;
const BMI_RATIO_MAX: f64 = 1.3;

/// Minimum gap between hips and waist circumference
pub const HIPS_OVER_WAIST_MIN_CM: f64 = 5.0;

/// Maximum amount the chest may sit below the waist
pub const CHEST_UNDER_WAIST_MAX_CM: f64 = 20.0;

/// Frame height assumed when no keypoint body height is available
const REFERENCE_FRAME_HEIGHT_PX: f64 = 1920.0;

/// Share of the frame the subject usually occupies in guided captures
const SUBJECT_FRAME_SHARE: f64 = 0.85;

/// Hip circumference to hip width, elliptical cross-section
const HIP_CIRCUMFERENCE_TO_WIDTH: f64 = 2.9;

/// Gender baselines at reference BMI
struct Baseline {
    height_cm: f64,
    weight_kg: f64,
    chest_cm: f64,
    waist_cm: f64,
    hips_cm: f64,
    shoulder_width_cm: f64,
}

fn baseline(gender: Gender) -> Baseline {
    match gender {
        Gender::Masculine => Baseline {
            height_cm: 175.0,
            weight_kg: 72.0,
            chest_cm: 98.0,
            waist_cm: 84.0,
            hips_cm: 97.0,
            shoulder_width_cm: 45.0,
        },
        Gender::Feminine => Baseline {
            height_cm: 163.0,
            weight_kg: 60.0,
            chest_cm: 90.0,
            waist_cm: 72.0,
            hips_cm: 99.0,
            shoulder_width_cm: 39.0,
        },
    }
}

/// Measurements as extracted from the photos; every field may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurements {
    pub chest_cm: Option<f64>,
    pub waist_cm: Option<f64>,
    pub hips_cm: Option<f64>,
    pub shoulder_width_cm: Option<f64>,
    pub hip_width_cm: Option<f64>,
    pub pixel_per_cm: Option<f64>,
    /// Subject height in pixels from keypoints (head to heel)
    pub body_height_px: Option<f64>,
}

/// What the user typed into the scan form
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeclaredBody {
    pub height_cm: f64,
    pub weight_kg: f64,
    pub gender: Gender,
}

impl DeclaredBody {
    pub fn bmi(&self) -> f64 {
        let h = self.height_cm / 100.0;
        self.weight_kg / (h * h)
    }
}

/// How `pixel_per_cm` was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMethod {
    VisionReference,
    KeypointHeight,
    DeclaredHeightFallback,
}

/// Declared BMI cross-checked against the photo waist-to-height ratio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmiValidation {
    pub declared_bmi: f64,
    pub waist_to_height: f64,
    pub consistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// A complete measurement set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedMeasurements {
    pub chest_cm: f64,
    pub waist_cm: f64,
    pub hips_cm: f64,
    pub shoulder_width_cm: f64,
    pub hip_width_cm: f64,
    pub pixel_per_cm: f64,
    pub estimated_bmi: f64,
    pub scale_method: ScaleMethod,
    /// Fields filled from formulae rather than vision data
    pub fallback_fields: Vec<String>,
    pub bmi_validation: BmiValidation,
}

impl EnhancedMeasurements {
    pub fn fallback_used(&self) -> bool {
        !self.fallback_fields.is_empty() || self.scale_method == ScaleMethod::DeclaredHeightFallback
    }
}

/// Accept a vision value only if finite, positive and anatomically plausible
fn plausible(
    value: Option<f64>,
    field: &str,
    range: (f64, f64),
    notes: &mut Vec<String>,
) -> Option<f64> {
    let v = value?;
    if !v.is_finite() || v <= 0.0 {
        notes.push(format!("{}: ignored invalid vision value", field));
        return None;
    }
    if v < range.0 || v > range.1 {
        notes.push(format!(
            "{}: ignored implausible vision value {:.1} (expected {:.0}-{:.0})",
            field, v, range.0, range.1
        ));
        return None;
    }
    Some(v)
}

/// Replace unusable declared values with the gender baseline
fn sanitize_declared(declared: &DeclaredBody, notes: &mut Vec<String>) -> DeclaredBody {
    let base = baseline(declared.gender);
    let mut out = *declared;
    if !(declared.height_cm.is_finite() && (100.0..=250.0).contains(&declared.height_cm)) {
        notes.push(format!(
            "declared height unusable, using {:.0} cm baseline",
            base.height_cm
        ));
        out.height_cm = base.height_cm;
    }
    if !(declared.weight_kg.is_finite() && (25.0..=350.0).contains(&declared.weight_kg)) {
        notes.push(format!(
            "declared weight unusable, using {:.0} kg baseline",
            base.weight_kg
        ));
        out.weight_kg = base.weight_kg;
    }
    out
}

/// Fill missing measurements and enforce girth invariants
///
/// Never fails: with no vision data at all the result is derived purely from
/// the declared height and weight.
pub fn enhance_measurements(
    raw: &RawMeasurements,
    declared: &DeclaredBody,
    notes: &mut Vec<String>,
) -> EnhancedMeasurements {
    let declared = sanitize_declared(declared, notes);
    let base = baseline(declared.gender);
    let bmi = declared.bmi();
    let bmi_ratio = (bmi / REFERENCE_BMI).clamp(BMI_RATIO_MIN, BMI_RATIO_MAX);
    let height_ratio = (declared.height_cm / base.height_cm).clamp(0.9, 1.1);

    let mut fallback_fields = Vec::new();
    let mut fill = |value: Option<f64>, field: &str, fallback: f64, notes: &mut Vec<String>| -> f64 {
        match value {
            Some(v) => v,
            None => {
                notes.push(format!("{}: fallback {:.1} cm from declared BMI {:.1}", field, fallback, bmi));
                fallback_fields.push(field.to_string());
                fallback
            }
        }
    };

    let waist_vision = plausible(raw.waist_cm, "waist_cm", (45.0, 180.0), notes);
    let waist = fill(waist_vision, "waist_cm", base.waist_cm * bmi_ratio, notes);

    let chest = plausible(raw.chest_cm, "chest_cm", (60.0, 180.0), notes);
    let mut chest = fill(chest, "chest_cm", base.chest_cm * bmi_ratio, notes);

    let hips = plausible(raw.hips_cm, "hips_cm", (60.0, 190.0), notes);
    let mut hips = fill(hips, "hips_cm", base.hips_cm * bmi_ratio, notes);

    let shoulder = plausible(raw.shoulder_width_cm, "shoulder_width_cm", (28.0, 65.0), notes);
    let shoulder = fill(shoulder, "shoulder_width_cm", base.shoulder_width_cm * height_ratio, notes);

    if hips < waist + HIPS_OVER_WAIST_MIN_CM {
        let corrected = waist + HIPS_OVER_WAIST_MIN_CM;
        notes.push(format!(
            "hips_cm corrected from {:.1} to {:.1} (must exceed waist by {:.0} cm)",
            hips, corrected, HIPS_OVER_WAIST_MIN_CM
        ));
        hips = corrected;
    }

    if chest < waist - CHEST_UNDER_WAIST_MAX_CM {
        let corrected = waist - CHEST_UNDER_WAIST_MAX_CM;
        notes.push(format!(
            "chest_cm corrected from {:.1} to {:.1} (may not sit more than {:.0} cm below waist)",
            chest, corrected, CHEST_UNDER_WAIST_MAX_CM
        ));
        chest = corrected;
    }

    // Derived after the hips correction so the width follows the final girth
    let hip_width = match plausible(raw.hip_width_cm, "hip_width_cm", (22.0, 65.0), notes) {
        Some(v) => v,
        None => {
            fallback_fields.push("hip_width_cm".to_string());
            hips / HIP_CIRCUMFERENCE_TO_WIDTH
        }
    };

    let (pixel_per_cm, scale_method) = resolve_scale(raw, declared.height_cm, notes);
    let bmi_validation = validate_bmi(bmi, waist, declared.height_cm, waist_vision.is_some());

    EnhancedMeasurements {
        chest_cm: chest,
        waist_cm: waist,
        hips_cm: hips,
        shoulder_width_cm: shoulder,
        hip_width_cm: hip_width,
        pixel_per_cm,
        estimated_bmi: bmi,
        scale_method,
        fallback_fields,
        bmi_validation,
    }
}

fn resolve_scale(raw: &RawMeasurements, height_cm: f64, notes: &mut Vec<String>) -> (f64, ScaleMethod) {
    if let Some(ppc) = plausible(raw.pixel_per_cm, "pixel_per_cm", (0.5, 100.0), notes) {
        return (ppc, ScaleMethod::VisionReference);
    }

    if let Some(px) = raw.body_height_px.filter(|v| v.is_finite() && *v > 0.0) {
        let ppc = px / height_cm;
        notes.push(format!(
            "pixel_per_cm missing, derived {:.3} from keypoint height and declared height",
            ppc
        ));
        return (ppc, ScaleMethod::KeypointHeight);
    }

    let ppc = REFERENCE_FRAME_HEIGHT_PX * SUBJECT_FRAME_SHARE / height_cm;
    notes.push(format!(
        "pixel_per_cm missing, using declared-height fallback scale {:.3}",
        ppc
    ));
    (ppc, ScaleMethod::DeclaredHeightFallback)
}

fn validate_bmi(bmi: f64, waist_cm: f64, height_cm: f64, waist_from_vision: bool) -> BmiValidation {
    let whtr = waist_cm / height_cm;

    let warning = if !waist_from_vision {
        None
    } else if bmi < 22.0 && whtr > 0.6 {
        Some(format!(
            "declared BMI {:.1} looks low for waist-to-height ratio {:.2}",
            bmi, whtr
        ))
    } else if bmi > 30.0 && whtr < 0.42 {
        Some(format!(
            "declared BMI {:.1} looks high for waist-to-height ratio {:.2}",
            bmi, whtr
        ))
    } else {
        None
    };

    BmiValidation {
        declared_bmi: bmi,
        waist_to_height: whtr,
        consistent: warning.is_none(),
        warning,
    }
}
