//! Archetype ranking
//!
//! Picks the archetypes nearest to a validated classification. Scoring is a
//! plain weighted agreement count with a BMI distance penalty; ties break on
//! archetype id so the same input always selects the same rows.

use super::semantic::SemanticProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use twinforge_common::morph::vocabulary::labels::muscularity_rank;
use twinforge_common::morph::{Archetype, LimbMassVector, MorphVector};

const OBESITY_WEIGHT: f64 = 3.0;
const LEVEL_WEIGHT: f64 = 2.0;
const MORPHOTYPE_WEIGHT: f64 = 1.5;
const MUSCULARITY_WEIGHT: f64 = 2.0;
const MUSCULARITY_STEP_PENALTY: f64 = 0.5;
const BMI_PENALTY_PER_POINT: f64 = 0.25;

/// Smallest weight an archetype contributes to the match blend
const MIN_BLEND_WEIGHT: f64 = 0.1;

/// An archetype with its match score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredArchetype {
    pub archetype: Archetype,
    pub score: f64,
}

/// Agreement score between an archetype and a classification
pub fn score_archetype(archetype: &Archetype, profile: &SemanticProfile, bmi: Option<f64>) -> f64 {
    let mut score = 0.0;
    if archetype.obesity == profile.obesity {
        score += OBESITY_WEIGHT;
    }
    if archetype.level == profile.level {
        score += LEVEL_WEIGHT;
    }
    if archetype.morphotype == profile.morphotype {
        score += MORPHOTYPE_WEIGHT;
    }

    let steps = (muscularity_rank(&archetype.muscularity) - muscularity_rank(&profile.muscularity)).abs();
    score += (MUSCULARITY_WEIGHT - MUSCULARITY_STEP_PENALTY * steps).max(0.0);

    if let (Some(a), Some(b)) = (archetype.bmi, bmi.filter(|b| b.is_finite())) {
        score -= BMI_PENALTY_PER_POINT * (a - b).abs();
    }
    score
}

/// Top `k` candidates, best first
pub fn rank_archetypes(
    candidates: &[Archetype],
    profile: &SemanticProfile,
    bmi: Option<f64>,
    k: usize,
) -> Vec<ScoredArchetype> {
    let mut scored: Vec<ScoredArchetype> = candidates
        .iter()
        .map(|a| ScoredArchetype {
            score: score_archetype(a, profile, bmi),
            archetype: a.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.archetype.id.cmp(&b.archetype.id))
    });
    scored.truncate(k);
    scored
}

/// Score-weighted mean of the selected archetypes' vectors
///
/// Keys absent from an archetype do not count toward that key's mean.
pub fn blend_match_vectors(ranked: &[ScoredArchetype]) -> (MorphVector, LimbMassVector) {
    (
        weighted_mean(ranked, |a| &a.morph_values),
        weighted_mean(ranked, |a| &a.limb_masses),
    )
}

fn weighted_mean<F>(ranked: &[ScoredArchetype], select: F) -> BTreeMap<String, f64>
where
    F: Fn(&Archetype) -> &BTreeMap<String, f64>,
{
    let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for s in ranked {
        let w = s.score.max(MIN_BLEND_WEIGHT);
        for (key, value) in select(&s.archetype) {
            let entry = sums.entry(key.clone()).or_insert((0.0, 0.0));
            entry.0 += w * value;
            entry.1 += w;
        }
    }
    sums.into_iter()
        .map(|(key, (sum, weight))| (key, sum / weight))
        .collect()
}
