//! scan-semantic
//!
//! Categorical body classification. Fails closed: a model error or a reply
//! without the four labels is returned to the client as an error.

use super::vision::{PhotoInput, VisionRequest};
use super::{parse_gender, require_user_id};
use crate::error::ApiError;
use crate::pipeline::prompt::build_semantic_prompt;
use crate::pipeline::reply::{optional_number, optional_number_map, parse_json_object, required_string};
use crate::pipeline::semantic::RawClassification;
use crate::pipeline::{validate_semantic_with_db, ReplyError, SemanticProfile, SemanticVocabulary, VocabularySource};
use crate::AppState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use twinforge_common::morph::vocabulary::{is_shape_key, RAW_SHAPE_MAX, RAW_SHAPE_MIN};
use twinforge_common::morph::{sanitize_vector, MorphVector};

const SYSTEM_PROMPT: &str = "You are a body composition classifier. You label bodies from photos \
     using only the labels you are given and reply with strict JSON only.";

#[derive(Debug, Clone, Deserialize)]
pub struct SemanticRequest {
    pub user_id: String,
    #[serde(default)]
    pub photos: Vec<PhotoInput>,
    pub user_declared_gender: String,
    #[serde(default)]
    pub estimated_bmi: Option<f64>,
    #[serde(default)]
    pub user_declared_height_cm: Option<f64>,
    #[serde(default)]
    pub user_declared_weight_kg: Option<f64>,
}

impl SemanticRequest {
    /// Estimated BMI, else computed from the declared body
    fn bmi(&self) -> Option<f64> {
        let usable = |b: &f64| b.is_finite() && *b > 0.0;
        let declared = self
            .user_declared_height_cm
            .zip(self.user_declared_weight_kg)
            .filter(|(h, _)| *h > 0.0)
            .map(|(h, w)| w / ((h / 100.0) * (h / 100.0)));
        self.estimated_bmi.filter(usable).or(declared.filter(usable))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticResponse {
    #[serde(flatten)]
    pub profile: SemanticProfile,
    pub muscularity_level: Option<f64>,
    pub adiposity_level: Option<f64>,
    pub region_scores: BTreeMap<String, f64>,
    pub confidence: Option<f64>,
    pub adjustments_made: Vec<String>,
    pub validation_flags: Vec<String>,
    /// Labels exactly as the model returned them
    pub raw_classification: SemanticProfile,
    /// Raw per-key morph estimates, clamped to the raw extraction range
    pub morph_values: MorphVector,
    pub dropped_keys: Vec<String>,
    pub model_id: String,
}

/// Parsed classification reply
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticReply {
    pub classification: RawClassification,
    pub region_scores: BTreeMap<String, f64>,
    pub confidence: Option<f64>,
    pub morph_values: MorphVector,
    pub dropped_keys: Vec<String>,
}

pub fn parse_semantic_reply(text: &str) -> Result<SemanticReply, ReplyError> {
    let obj = parse_json_object(text)?;

    let profile = SemanticProfile {
        obesity: required_string(&obj, "obesity")?,
        muscularity: required_string(&obj, "muscularity")?,
        level: required_string(&obj, "level")?,
        morphotype: required_string(&obj, "morphotype")?,
    };
    let unit = |v: Option<f64>| v.map(|v| v.clamp(0.0, 1.0));

    let raw_morphs = optional_number_map(&obj, "morph_values")?;
    let (morph_values, report) = sanitize_vector(&raw_morphs, is_shape_key);
    let morph_values = morph_values
        .into_iter()
        .map(|(k, v)| (k, v.clamp(RAW_SHAPE_MIN, RAW_SHAPE_MAX)))
        .collect();

    Ok(SemanticReply {
        classification: RawClassification {
            profile,
            muscularity_level: unit(optional_number(&obj, "muscularity_level")?),
            adiposity_level: unit(optional_number(&obj, "adiposity_level")?),
        },
        region_scores: optional_number_map(&obj, "region_scores")?,
        confidence: unit(optional_number(&obj, "confidence")?),
        morph_values,
        dropped_keys: report.unknown_keys,
    })
}

/// Run the semantic stage
pub async fn run_semantic(state: &AppState, request: SemanticRequest) -> Result<SemanticResponse, ApiError> {
    require_user_id(&request.user_id)?;
    if request.photos.is_empty() {
        return Err(ApiError::BadRequest("photos: at least one photo is required".to_string()));
    }
    let gender = parse_gender("user_declared_gender", &request.user_declared_gender)?;
    let bmi = request.bmi();

    // The prompt lists the live labels; validation re-reads them below
    let prompt_vocabulary = match state.archetypes.valid_values_for(gender).await {
        Ok(v) => v,
        Err(e) => {
            warn!(%gender, error = %e, "Vocabulary lookup failed, prompting with default labels");
            SemanticVocabulary::defaults()
        }
    };

    let vision_request = VisionRequest::new(
        SYSTEM_PROMPT,
        build_semantic_prompt(gender, bmi, &prompt_vocabulary),
        request.photos.clone(),
    );
    let text = state.vision.complete(&vision_request).await?;
    let reply = parse_semantic_reply(&text)?;

    let validation = validate_semantic_with_db(
        &reply.classification,
        bmi.unwrap_or(f64::NAN),
        gender,
        &state.archetypes,
    )
    .await;

    info!(
        user_id = %request.user_id,
        %gender,
        obesity = %validation.profile.obesity,
        muscularity = %validation.profile.muscularity,
        adjustments = validation.adjustments_made.len(),
        "Semantic classification complete"
    );

    Ok(SemanticResponse {
        profile: validation.profile,
        muscularity_level: reply.classification.muscularity_level,
        adiposity_level: reply.classification.adiposity_level,
        region_scores: reply.region_scores,
        confidence: reply.confidence,
        adjustments_made: validation.adjustments_made,
        validation_flags: validation.validation_flags,
        raw_classification: reply.classification.profile,
        morph_values: reply.morph_values,
        dropped_keys: reply.dropped_keys,
        model_id: state.vision.model_id().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_required() {
        let err = parse_semantic_reply(r#"{"obesity": "Obèse", "muscularity": "Normal", "level": "Obèse"}"#)
            .unwrap_err();
        assert_eq!(err, ReplyError::MissingField("morphotype".to_string()));
    }

    #[test]
    fn test_morph_values_filtered_and_clamped() {
        let reply = parse_semantic_reply(
            r#"{"obesity": "Obèse", "muscularity": "Normal", "level": "Obèse", "morphotype": "ROND",
                "muscularity_level": 0.2, "confidence": 0.8,
                "morph_values": {"bellyFat": 4.5, "wings": 1.0, "emaciated": -0.5}}"#,
        )
        .unwrap();
        assert_eq!(reply.morph_values["bellyFat"], RAW_SHAPE_MAX);
        assert_eq!(reply.morph_values["emaciated"], -0.5);
        assert!(!reply.morph_values.contains_key("wings"));
        assert_eq!(reply.dropped_keys, vec!["wings".to_string()]);
        assert_eq!(reply.classification.muscularity_level, Some(0.2));
    }

    #[test]
    fn test_bmi_from_declared_body() {
        let request = SemanticRequest {
            user_id: "u".to_string(),
            photos: Vec::new(),
            user_declared_gender: "masculine".to_string(),
            estimated_bmi: None,
            user_declared_height_cm: Some(180.0),
            user_declared_weight_kg: Some(81.0),
        };
        assert!((request.bmi().unwrap() - 25.0).abs() < 1e-9);

        let estimated = SemanticRequest {
            estimated_bmi: Some(32.0),
            ..request
        };
        assert_eq!(estimated.bmi(), Some(32.0));
    }

    #[test]
    fn test_unusable_estimate_falls_back_to_declared_body() {
        let base = SemanticRequest {
            user_id: "u".to_string(),
            photos: Vec::new(),
            user_declared_gender: "masculine".to_string(),
            estimated_bmi: Some(-1.0),
            user_declared_height_cm: Some(180.0),
            user_declared_weight_kg: Some(100.0),
        };
        let expected = 100.0 / (1.8 * 1.8);
        assert!((base.bmi().unwrap() - expected).abs() < 1e-9);

        for estimate in [0.0, f64::NAN, f64::INFINITY] {
            let request = SemanticRequest {
                estimated_bmi: Some(estimate),
                ..base.clone()
            };
            assert!((request.bmi().unwrap() - expected).abs() < 1e-9);
        }

        let nothing_usable = SemanticRequest {
            user_declared_weight_kg: Some(-5.0),
            ..base
        };
        assert_eq!(nothing_usable.bmi(), None);
    }
}
