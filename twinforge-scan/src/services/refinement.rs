//! scan-refine-morphs
//!
//! Asks the vision model to adjust the archetype blend toward the photos,
//! inside the envelope, then clamps whatever comes back. Fails closed.

use super::vision::{PhotoInput, VisionRequest};
use super::{parse_gender, require_user_id};
use crate::error::ApiError;
use crate::pipeline::refine::Violation;
use crate::pipeline::semantic::RawClassification;
use crate::pipeline::{
    build_envelope, build_refinement_prompt, clamp_to_envelope, parse_refinement_reply, BodyRatios, BoundsSource,
    Envelope, RawMeasurements, RefinementContext,
};
use crate::AppState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use twinforge_common::morph::vocabulary::{is_limb_key, is_shape_key};
use twinforge_common::morph::{sanitize_vector, LimbMassVector, MorphVector, PhysioBounds};

const SYSTEM_PROMPT: &str = "You are a 3D body morph specialist. You adjust morph parameters so an \
     avatar matches the photos, never leaving the ranges you are given, and reply with strict JSON only.";

#[derive(Debug, Clone, Deserialize)]
pub struct RefineRequest {
    pub user_id: String,
    pub resolved_gender: String,
    #[serde(default)]
    pub photos: Vec<PhotoInput>,
    pub blend_shape_params: BTreeMap<String, f64>,
    pub blend_limb_masses: BTreeMap<String, f64>,
    /// Envelope from scan-match; re-checked against the DB bounds
    #[serde(default)]
    pub k5_envelope: Option<Envelope>,
    /// Used to rebuild the envelope when the client did not send one
    #[serde(default)]
    pub selected_archetype_ids: Vec<String>,
    #[serde(default)]
    pub vision_classification: Option<RawClassification>,
    #[serde(default)]
    pub estimated_bmi: Option<f64>,
    #[serde(default)]
    pub measurements: Option<RawMeasurements>,
}

/// How the envelope used for clamping was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeOrigin {
    Client,
    Archetypes,
    DbBounds,
}

/// Self-reported clamp bookkeeping from the model, kept for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub clamped_keys: Vec<String>,
    pub envelope_violations: Vec<String>,
    pub db_violations: Vec<String>,
    pub out_of_range_count: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefineResponse {
    pub final_shape_params: MorphVector,
    pub final_limb_masses: LimbMassVector,
    pub ai_confidence: f64,
    pub refinement_notes: Vec<String>,
    pub clamped_keys: Vec<String>,
    pub envelope_violations: Vec<Violation>,
    pub db_violations: Vec<Violation>,
    pub out_of_range_count: usize,
    pub dropped_keys: Vec<String>,
    pub filled_keys: Vec<String>,
    pub model_report: ModelReport,
    pub envelope_origin: EnvelopeOrigin,
    pub k5_envelope: Envelope,
    pub model_id: String,
}

/// Envelope to clamp against, never wider than the bounds
async fn resolve_envelope(
    state: &AppState,
    request: &RefineRequest,
    bounds: &PhysioBounds,
) -> Result<(Envelope, EnvelopeOrigin), ApiError> {
    if let Some(envelope) = &request.k5_envelope {
        return Ok((envelope.constrain_to(bounds), EnvelopeOrigin::Client));
    }
    if !request.selected_archetype_ids.is_empty() {
        let rows = state.archetypes.load_by_ids(&request.selected_archetype_ids).await?;
        if !rows.is_empty() {
            return Ok((build_envelope(&rows, bounds), EnvelopeOrigin::Archetypes));
        }
        warn!(ids = ?request.selected_archetype_ids, "No selected archetype found, using DB bounds");
    }
    Ok((Envelope::from_bounds(bounds), EnvelopeOrigin::DbBounds))
}

/// Run the refinement stage
pub async fn run_refinement(state: &AppState, request: RefineRequest) -> Result<RefineResponse, ApiError> {
    require_user_id(&request.user_id)?;
    let gender = parse_gender("resolved_gender", &request.resolved_gender)?;

    let (blend_shape, shape_report) = sanitize_vector(&request.blend_shape_params, is_shape_key);
    let (blend_limbs, limb_report) = sanitize_vector(&request.blend_limb_masses, is_limb_key);
    if blend_shape.is_empty() {
        return Err(ApiError::BadRequest(
            "blend_shape_params: no canonical shape keys".to_string(),
        ));
    }
    let mut notes = Vec::new();
    for key in shape_report.unknown_keys.iter().chain(&limb_report.unknown_keys) {
        notes.push(format!("blend key '{}' is not in the morph vocabulary, dropped", key));
    }

    let bounds = state.archetypes.bounds_for(gender).await?;
    let (envelope, envelope_origin) = resolve_envelope(state, &request, &bounds).await?;
    debug!(%gender, origin = ?envelope_origin, "Refinement envelope resolved");

    let ratios = request
        .measurements
        .as_ref()
        .map(BodyRatios::from_partial)
        .unwrap_or_default();
    let ctx = RefinementContext {
        gender,
        profile: request.vision_classification.as_ref().map(|c| &c.profile),
        muscularity_level: request.vision_classification.as_ref().and_then(|c| c.muscularity_level),
        bmi: request.estimated_bmi.filter(|b| b.is_finite()),
        blend_shape_params: &blend_shape,
        blend_limb_masses: &blend_limbs,
        envelope: &envelope,
        bounds: &bounds,
        ratios,
    };
    let vision_request = VisionRequest::new(SYSTEM_PROMPT, build_refinement_prompt(&ctx), request.photos.clone());

    let text = state.vision.complete(&vision_request).await?;
    let reply = parse_refinement_reply(&text)?;

    let outcome = clamp_to_envelope(
        &reply.final_shape_params,
        &reply.final_limb_masses,
        &blend_shape,
        &blend_limbs,
        &envelope,
        &bounds,
    );

    notes.extend(reply.refinement_notes);
    info!(
        user_id = %request.user_id,
        %gender,
        confidence = reply.ai_confidence,
        clamped = outcome.clamped_keys.len(),
        out_of_range = outcome.out_of_range_count,
        "Morph refinement complete"
    );

    Ok(RefineResponse {
        final_shape_params: outcome.final_shape_params,
        final_limb_masses: outcome.final_limb_masses,
        ai_confidence: reply.ai_confidence,
        refinement_notes: notes,
        clamped_keys: outcome.clamped_keys,
        envelope_violations: outcome.envelope_violations,
        db_violations: outcome.db_violations,
        out_of_range_count: outcome.out_of_range_count,
        dropped_keys: outcome.dropped_keys,
        filled_keys: outcome.filled_keys,
        model_report: ModelReport {
            clamped_keys: reply.clamped_keys,
            envelope_violations: reply.envelope_violations,
            db_violations: reply.db_violations,
            out_of_range_count: reply.out_of_range_count,
        },
        envelope_origin,
        k5_envelope: envelope,
        model_id: state.vision.model_id().to_string(),
    })
}
