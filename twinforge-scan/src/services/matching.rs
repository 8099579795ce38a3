//! scan-match
//!
//! Selects the K nearest reference archetypes for a validated
//! classification, builds their envelope and blends their vectors into the
//! starting point for refinement.

use super::parse_gender;
use crate::error::ApiError;
use crate::pipeline::matching::{blend_match_vectors, rank_archetypes};
use crate::pipeline::{build_envelope, compute_bounds, Envelope, SemanticProfile, ENVELOPE_K};
use crate::AppState;
use serde::{Deserialize, Serialize};
use tracing::info;
use twinforge_common::morph::{LimbMassVector, MorphVector, PhysioBounds};

#[derive(Debug, Clone, Deserialize)]
pub struct MatchRequest {
    pub resolved_gender: String,
    #[serde(flatten)]
    pub profile: SemanticProfile,
    #[serde(default)]
    pub estimated_bmi: Option<f64>,
    /// Number of archetypes to select, at most the envelope size
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedArchetype {
    pub id: String,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResponse {
    pub selected_archetypes: Vec<SelectedArchetype>,
    pub k5_envelope: Envelope,
    pub blend_shape_params: MorphVector,
    pub blend_limb_masses: LimbMassVector,
    pub db_bounds: PhysioBounds,
}

pub async fn run_match(state: &AppState, request: MatchRequest) -> Result<MatchResponse, ApiError> {
    let gender = parse_gender("resolved_gender", &request.resolved_gender)?;
    let candidates = state.archetypes.load_for_gender(gender).await?;
    if candidates.is_empty() {
        return Err(ApiError::Internal(format!("No reference archetypes for gender {}", gender)));
    }

    let bounds = compute_bounds(&candidates, gender);
    let k = request.k.unwrap_or(ENVELOPE_K).clamp(1, ENVELOPE_K);
    let bmi = request.estimated_bmi.filter(|b| b.is_finite() && *b > 0.0);
    let ranked = rank_archetypes(&candidates, &request.profile, bmi, k);

    let selected: Vec<_> = ranked.iter().map(|s| s.archetype.clone()).collect();
    let envelope = build_envelope(&selected, &bounds);
    let (blend_shape_params, blend_limb_masses) = blend_match_vectors(&ranked);

    info!(
        %gender,
        selected = ?envelope.metadata.archetypes_used,
        best_score = ranked.first().map(|s| s.score),
        "Archetypes matched"
    );

    Ok(MatchResponse {
        selected_archetypes: ranked
            .iter()
            .map(|s| SelectedArchetype {
                id: s.archetype.id.clone(),
                name: s.archetype.name.clone(),
                score: s.score,
            })
            .collect(),
        k5_envelope: envelope,
        blend_shape_params,
        blend_limb_masses,
        db_bounds: bounds,
    })
}
