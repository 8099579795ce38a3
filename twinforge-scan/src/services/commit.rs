//! scan-commit
//!
//! Persists a finished scan and publishes the result to the user's avatar
//! preferences. Every stage result arrives as a [`PipelineStage`]; only a
//! ready refinement can be committed.

use super::{parse_gender, require_user_id};
use crate::db::profiles::{get_profile, upsert_profile_body, upsert_profile_preferences};
use crate::db::scans::{insert_scan, ScanRecord};
use crate::error::ApiError;
use crate::pipeline::refine::enforce_banned_keys;
use crate::pipeline::{BoundsSource, PipelineStage, SemanticProfile};
use crate::AppState;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use twinforge_common::morph::vocabulary::{is_limb_key, LIMB_MASS_DEFAULT, MORPH_VOCABULARY_VERSION};
use twinforge_common::morph::{sanitize_vector, LimbMassVector, MorphVector};
use twinforge_common::Gender;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateStage {
    pub raw_measurements: Value,
    #[serde(default)]
    pub estimated_bmi: Option<f64>,
    #[serde(default)]
    pub skin_tone: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticStage {
    #[serde(flatten)]
    pub profile: SemanticProfile,
    #[serde(default)]
    pub validation_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementStage {
    pub final_shape_params: MorphVector,
    pub final_limb_masses: LimbMassVector,
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRequest {
    pub user_id: String,
    /// Client-chosen id; retrying a commit with the same id is a conflict
    #[serde(default)]
    pub scan_id: Option<Uuid>,
    /// Gender saved with the scan payload
    #[serde(default)]
    pub resolved_gender: Option<String>,
    #[serde(default)]
    pub gender_override: Option<String>,
    #[serde(default)]
    pub user_declared_height_cm: Option<f64>,
    #[serde(default)]
    pub user_declared_weight_kg: Option<f64>,
    #[serde(default)]
    pub estimate: PipelineStage<EstimateStage>,
    #[serde(default)]
    pub semantic: PipelineStage<SemanticStage>,
    #[serde(default)]
    pub refinement: PipelineStage<RefinementStage>,
    #[serde(default)]
    pub k5_envelope: Option<Value>,
    /// Extra avatar fields merged into the profile preferences
    #[serde(default)]
    pub avatar: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResponse {
    pub success: bool,
    pub scan_id: Uuid,
    pub processing_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_gender: Option<Gender>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub adjusted_keys: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub mock: bool,
}

/// Pick the gender a scan is stored under
///
/// Priority: saved payload, explicit override, stored profile.
pub fn resolve_gender(
    payload: Option<&str>,
    override_value: Option<&str>,
    profile: Option<Gender>,
) -> Result<Gender, ApiError> {
    fn present(v: Option<&str>) -> Option<&str> {
        v.filter(|s| !s.trim().is_empty())
    }
    if let Some(value) = present(payload) {
        return parse_gender("resolved_gender", value);
    }
    if let Some(value) = present(override_value) {
        return parse_gender("gender_override", value);
    }
    profile.ok_or_else(|| {
        ApiError::BadRequest(
            "resolved_gender: not in payload, no override and no gender on the user profile".to_string(),
        )
    })
}

/// Limb masses restricted to canonical keys with positive values
fn sanitize_limbs(limbs: &LimbMassVector, adjusted: &mut Vec<String>) -> LimbMassVector {
    let (clean, report) = sanitize_vector(limbs, is_limb_key);
    adjusted.extend(report.unknown_keys);
    clean
        .into_iter()
        .map(|(key, value)| {
            if value > 0.0 {
                (key, value)
            } else {
                adjusted.push(key.clone());
                (key, LIMB_MASS_DEFAULT)
            }
        })
        .collect()
}

/// Run the commit stage
pub async fn run_commit(state: &AppState, request: CommitRequest) -> Result<CommitResponse, ApiError> {
    require_user_id(&request.user_id)?;

    if state.settings.is_mock_user(&request.user_id) {
        let scan_id = request.scan_id.unwrap_or_else(Uuid::new_v4);
        info!(user_id = %request.user_id, %scan_id, "Mock user commit, skipping database");
        return Ok(CommitResponse {
            success: true,
            scan_id,
            processing_complete: true,
            resolved_gender: None,
            adjusted_keys: Vec::new(),
            mock: true,
        });
    }

    let refinement = request.refinement.require("refinement").map_err(ApiError::BadRequest)?;

    let (raw_measurements, estimated_bmi, estimate_skin_tone) = match &request.estimate {
        PipelineStage::Ready { data } => (
            Some(data.raw_measurements.clone()),
            data.estimated_bmi,
            data.skin_tone.clone(),
        ),
        PipelineStage::Failed { reason } => {
            warn!(user_id = %request.user_id, %reason, "Committing scan without estimate data");
            (None, None, None)
        }
        PipelineStage::Pending => {
            return Err(ApiError::BadRequest("estimate stage has not completed".to_string()));
        }
    };

    let semantic_profile = match &request.semantic {
        PipelineStage::Ready { data } => Some(serde_json::to_value(data).map_err(|e| {
            ApiError::Internal(format!("semantic stage not serializable: {}", e))
        })?),
        PipelineStage::Failed { reason } => {
            warn!(user_id = %request.user_id, %reason, "Committing scan without semantic profile");
            Some(json!({ "status": "failed", "reason": reason }))
        }
        PipelineStage::Pending => {
            return Err(ApiError::BadRequest("semantic stage has not completed".to_string()));
        }
    };

    let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
    let profile_gender = if blank(&request.resolved_gender) && blank(&request.gender_override) {
        get_profile(&state.db, &request.user_id).await?.and_then(|p| p.gender)
    } else {
        None
    };
    let gender = resolve_gender(
        request.resolved_gender.as_deref(),
        request.gender_override.as_deref(),
        profile_gender,
    )?;

    let bounds = state.archetypes.bounds_for(gender).await?;
    let (final_shape_params, mut adjusted_keys) = enforce_banned_keys(&refinement.final_shape_params, &bounds);
    if final_shape_params.is_empty() {
        return Err(ApiError::BadRequest(
            "final_shape_params: no canonical shape keys".to_string(),
        ));
    }
    let final_limb_masses = sanitize_limbs(&refinement.final_limb_masses, &mut adjusted_keys);
    if !adjusted_keys.is_empty() {
        warn!(user_id = %request.user_id, keys = ?adjusted_keys, "Final vectors adjusted at commit");
    }

    let declared_bmi = request
        .user_declared_height_cm
        .zip(request.user_declared_weight_kg)
        .filter(|(h, w)| *h > 0.0 && *w > 0.0)
        .map(|(h, w)| w / ((h / 100.0) * (h / 100.0)));
    let skin_tone = estimate_skin_tone.or_else(|| request.avatar.get("skin_tone").cloned());
    let model_id = refinement
        .model_id
        .clone()
        .unwrap_or_else(|| state.vision.model_id().to_string());

    let scan = ScanRecord {
        id: request.scan_id.unwrap_or_else(Uuid::new_v4),
        user_id: request.user_id.clone(),
        resolved_gender: gender,
        declared_height_cm: request.user_declared_height_cm,
        declared_weight_kg: request.user_declared_weight_kg,
        estimated_bmi: estimated_bmi.or(declared_bmi),
        raw_measurements,
        semantic_profile,
        envelope: request.k5_envelope.clone(),
        final_shape_params,
        final_limb_masses,
        skin_tone,
        model_id: Some(model_id),
        vocabulary_version: MORPH_VOCABULARY_VERSION.to_string(),
        created_at: Utc::now(),
    };
    insert_scan(&state.db, &scan).await?;

    upsert_profile_body(
        &state.db,
        &scan.user_id,
        Some(gender),
        request.user_declared_height_cm,
        request.user_declared_weight_kg,
    )
    .await?;
    upsert_profile_preferences(&state.db, &scan.user_id, &avatar_update(&request.avatar, &scan)).await?;

    info!(
        user_id = %scan.user_id,
        scan_id = %scan.id,
        %gender,
        adjusted = adjusted_keys.len(),
        "Scan committed"
    );

    Ok(CommitResponse {
        success: true,
        scan_id: scan.id,
        processing_complete: true,
        resolved_gender: Some(gender),
        adjusted_keys,
        mock: false,
    })
}

/// Preference keys written by a commit; server fields win over client ones
fn avatar_update(client: &Map<String, Value>, scan: &ScanRecord) -> Map<String, Value> {
    let mut update = client.clone();
    update.insert("last_body_scan_id".to_string(), json!(scan.id));
    update.insert("avatar_gender".to_string(), json!(scan.resolved_gender));
    update.insert("avatar_shape_params".to_string(), json!(scan.final_shape_params));
    update.insert("avatar_limb_masses".to_string(), json!(scan.final_limb_masses));
    update.insert("morph_vocabulary_version".to_string(), json!(scan.vocabulary_version));
    update.insert(
        "avatar_updated_at".to_string(),
        json!(scan.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    if let Some(skin) = &scan.skin_tone {
        update.insert("avatar_skin_tone".to_string(), skin.clone());
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_priority() {
        assert_eq!(
            resolve_gender(Some("feminine"), Some("masculine"), Some(Gender::Masculine)).unwrap(),
            Gender::Feminine
        );
        assert_eq!(
            resolve_gender(None, Some("masculine"), Some(Gender::Feminine)).unwrap(),
            Gender::Masculine
        );
        assert_eq!(resolve_gender(Some(" "), None, Some(Gender::Feminine)).unwrap(), Gender::Feminine);
        assert!(matches!(resolve_gender(None, None, None), Err(ApiError::BadRequest(_))));
        assert!(matches!(resolve_gender(Some("robot"), None, None), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_sanitize_limbs() {
        let mut limbs = LimbMassVector::new();
        limbs.insert("armMass".to_string(), 1.1);
        limbs.insert("legMass".to_string(), -0.2);
        limbs.insert("tailMass".to_string(), 1.0);
        let mut adjusted = Vec::new();
        let clean = sanitize_limbs(&limbs, &mut adjusted);
        assert_eq!(clean["armMass"], 1.1);
        assert_eq!(clean["legMass"], LIMB_MASS_DEFAULT);
        assert!(!clean.contains_key("tailMass"));
        assert_eq!(adjusted, vec!["tailMass".to_string(), "legMass".to_string()]);
    }

    #[test]
    fn test_stage_payload_shape() {
        let stage: PipelineStage<RefinementStage> = serde_json::from_value(json!({
            "status": "ready",
            "data": {"final_shape_params": {"bigHips": 0.2}, "final_limb_masses": {"armMass": 1.0}}
        }))
        .unwrap();
        assert_eq!(stage.as_ready().unwrap().final_shape_params["bigHips"], 0.2);

        let failed: PipelineStage<EstimateStage> =
            serde_json::from_value(json!({"status": "failed", "reason": "timeout"})).unwrap();
        assert_eq!(failed.status(), "failed");
    }
}
