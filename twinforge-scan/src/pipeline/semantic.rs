//! Semantic classification validation
//!
//! The vision model classifies the body into four categorical labels. Which
//! labels are valid is not fixed in code: it is whatever the archetype table
//! currently contains for the gender, fetched through a [`VocabularySource`].
//! Labels outside that set are remapped with deterministic rules, then the
//! result is cross-checked against BMI. Every change is recorded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use twinforge_common::morph::vocabulary::labels::{self, muscularity_rank};
use twinforge_common::Gender;

/// BMI above which a body is considered obese
pub const BMI_OBESE: f64 = 30.0;
/// BMI above which a body is considered overweight
pub const BMI_OVERWEIGHT: f64 = 25.0;
/// BMI below which a body is considered thin
pub const BMI_THIN: f64 = 18.5;
/// Muscularity score under which an obese BMI wins over a muscular label
pub const LOW_MUSCULARITY_LEVEL: f64 = 0.4;

/// Four-label body classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticProfile {
    pub obesity: String,
    pub muscularity: String,
    pub level: String,
    pub morphotype: String,
}

/// Classification as returned by the vision model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawClassification {
    #[serde(flatten)]
    pub profile: SemanticProfile,
    /// 0 = no visible muscle definition, 1 = competitive bodybuilder
    pub muscularity_level: Option<f64>,
    /// 0 = very lean, 1 = severe adiposity
    pub adiposity_level: Option<f64>,
}

/// Valid labels per category for one gender
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticVocabulary {
    pub obesity: Vec<String>,
    pub muscularity: Vec<String>,
    pub level: Vec<String>,
    pub morphotype: Vec<String>,
}

impl SemanticVocabulary {
    /// Hardcoded vocabulary used when reference data is unavailable
    pub fn defaults() -> Self {
        let own = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            obesity: own(labels::DEFAULT_OBESITY),
            muscularity: own(labels::MUSCULARITY_ORDER),
            level: own(labels::DEFAULT_LEVEL),
            morphotype: own(labels::DEFAULT_MORPHOTYPE),
        }
    }

    /// Replace empty categories with defaults, returning the names replaced
    fn fill_empty(&mut self) -> Vec<&'static str> {
        let defaults = Self::defaults();
        let mut replaced = Vec::new();
        if self.obesity.is_empty() {
            self.obesity = defaults.obesity;
            replaced.push("obesity");
        }
        if self.muscularity.is_empty() {
            self.muscularity = defaults.muscularity;
            replaced.push("muscularity");
        }
        if self.level.is_empty() {
            self.level = defaults.level;
            replaced.push("level");
        }
        if self.morphotype.is_empty() {
            self.morphotype = defaults.morphotype;
            replaced.push("morphotype");
        }
        replaced
    }

    /// Muscularity labels sorted weakest first
    fn muscularity_by_strength(&self) -> Vec<&str> {
        let mut sorted: Vec<&str> = self.muscularity.iter().map(String::as_str).collect();
        sorted.sort_by(|a, b| {
            muscularity_rank(a)
                .partial_cmp(&muscularity_rank(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        sorted
    }
}

/// Where valid labels come from
#[async_trait]
pub trait VocabularySource: Send + Sync {
    async fn valid_values_for(&self, gender: Gender) -> twinforge_common::Result<SemanticVocabulary>;
}

/// Outcome of validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticValidation {
    pub profile: SemanticProfile,
    pub adjustments_made: Vec<String>,
    pub validation_flags: Vec<String>,
    pub vocabulary: SemanticVocabulary,
}

/// Validate a raw classification against live reference data and BMI
///
/// Never fails: a vocabulary lookup error switches to the default vocabulary
/// and is flagged `db_fetch_failed`.
pub async fn validate_semantic_with_db(
    raw: &RawClassification,
    bmi: f64,
    gender: Gender,
    source: &dyn VocabularySource,
) -> SemanticValidation {
    let mut flags = Vec::new();

    let mut vocabulary = match source.valid_values_for(gender).await {
        Ok(v) => v,
        Err(e) => {
            warn!(%gender, error = %e, "Vocabulary lookup failed, using default labels");
            flags.push("db_fetch_failed".to_string());
            SemanticVocabulary::defaults()
        }
    };
    for category in vocabulary.fill_empty() {
        flags.push(format!("vocabulary_empty_{}", category));
    }

    let mut adjustments = Vec::new();
    let profile = reconcile(raw, bmi, &vocabulary, &mut adjustments, &mut flags);

    debug!(
        %gender,
        bmi,
        adjustments = adjustments.len(),
        flags = ?flags,
        "Semantic classification validated"
    );

    SemanticValidation {
        profile,
        adjustments_made: adjustments,
        validation_flags: flags,
        vocabulary,
    }
}

/// Remap invalid labels and apply BMI consistency rules
pub fn reconcile(
    raw: &RawClassification,
    bmi: f64,
    vocabulary: &SemanticVocabulary,
    adjustments: &mut Vec<String>,
    flags: &mut Vec<String>,
) -> SemanticProfile {
    let bmi = if bmi.is_finite() && bmi > 0.0 {
        Some(bmi)
    } else {
        flags.push("bmi_unavailable".to_string());
        None
    };
    let mut profile = raw.profile.clone();

    // Invalid labels
    if !contains(&vocabulary.obesity, &profile.obesity) {
        let chain = obesity_chain(bmi);
        let remapped = pick(&chain, &vocabulary.obesity, flags);
        adjustments.push(format!("obesity_remapped: {} -> {}", profile.obesity, remapped));
        flags.push("obesity_remapped".to_string());
        profile.obesity = remapped;
    }

    if !contains(&vocabulary.muscularity, &profile.muscularity) {
        let remapped = remap_muscularity(raw.muscularity_level, bmi, vocabulary, flags);
        adjustments.push(format!(
            "muscularity_remapped: {} -> {} (level {})",
            profile.muscularity,
            remapped,
            raw.muscularity_level
                .map(|l| format!("{:.2}", l))
                .unwrap_or_else(|| "N/A".to_string())
        ));
        flags.push("muscularity_remapped".to_string());
        profile.muscularity = remapped;
    }

    if !contains(&vocabulary.level, &profile.level) {
        let remapped = pick(&level_chain(bmi), &vocabulary.level, flags);
        adjustments.push(format!("level_remapped: {} -> {}", profile.level, remapped));
        flags.push("level_remapped".to_string());
        profile.level = remapped;
    }

    if !contains(&vocabulary.morphotype, &profile.morphotype) {
        let mut sorted = vocabulary.morphotype.clone();
        sorted.sort();
        let remapped = sorted.into_iter().next().unwrap_or_default();
        adjustments.push(format!("morphotype_defaulted: {} -> {}", profile.morphotype, remapped));
        flags.push("morphotype_defaulted".to_string());
        profile.morphotype = remapped;
    }

    let Some(bmi) = bmi else {
        return profile;
    };

    // BMI consistency
    if bmi > BMI_OBESE && profile.obesity == labels::OBESITY_NON_OBESE {
        let adjusted = pick(&[labels::OBESITY_OBESE, labels::OBESITY_OVERWEIGHT], &vocabulary.obesity, flags);
        adjustments.push(format!(
            "obesity_adjusted_for_bmi: {} -> {} (BMI {:.1})",
            profile.obesity, adjusted, bmi
        ));
        flags.push("bmi_obesity_conflict".to_string());
        profile.obesity = adjusted;
    } else if bmi < BMI_OVERWEIGHT && profile.obesity == labels::OBESITY_OBESE {
        let adjusted = pick(&[labels::OBESITY_NON_OBESE, labels::OBESITY_OVERWEIGHT], &vocabulary.obesity, flags);
        adjustments.push(format!(
            "obesity_adjusted_for_bmi: {} -> {} (BMI {:.1})",
            profile.obesity, adjusted, bmi
        ));
        flags.push("bmi_obesity_conflict".to_string());
        profile.obesity = adjusted;
    }

    let level_target = if bmi > BMI_OBESE
        && (profile.level == labels::LEVEL_THIN || profile.level == labels::LEVEL_NORMAL)
    {
        Some([labels::LEVEL_OBESE, labels::LEVEL_OVERWEIGHT])
    } else if bmi >= BMI_OVERWEIGHT && profile.level == labels::LEVEL_THIN {
        Some([labels::LEVEL_OVERWEIGHT, labels::LEVEL_NORMAL])
    } else if bmi < BMI_OVERWEIGHT && profile.level == labels::LEVEL_OBESE {
        Some([labels::LEVEL_NORMAL, labels::LEVEL_THIN])
    } else if bmi < BMI_THIN && profile.level == labels::LEVEL_OVERWEIGHT {
        Some([labels::LEVEL_THIN, labels::LEVEL_NORMAL])
    } else {
        None
    };

    if let Some(chain) = level_target {
        let adjusted = pick(&chain, &vocabulary.level, flags);
        adjustments.push(format!(
            "level_adjusted_for_bmi: {} -> {} (BMI {:.1})",
            profile.level, adjusted, bmi
        ));
        flags.push("bmi_level_conflict".to_string());
        profile.level = adjusted;
    }

    profile
}

fn contains(valid: &[String], label: &str) -> bool {
    valid.iter().any(|v| v == label)
}

/// First label of `chain` present in `valid`
///
/// When none is present the first label of the chain is used anyway and
/// flagged, so a rule's intent is never silently dropped.
fn pick(chain: &[&str], valid: &[String], flags: &mut Vec<String>) -> String {
    if let Some(found) = chain.iter().find(|c| contains(valid, c)) {
        return found.to_string();
    }
    let label = chain.first().copied().unwrap_or_default();
    flags.push(format!("label_outside_vocabulary:{}", label));
    label.to_string()
}

fn obesity_chain(bmi: Option<f64>) -> Vec<&'static str> {
    match bmi {
        Some(b) if b > BMI_OBESE => vec![labels::OBESITY_OBESE, labels::OBESITY_OVERWEIGHT],
        Some(b) if b > BMI_OVERWEIGHT => vec![labels::OBESITY_OVERWEIGHT, labels::OBESITY_NON_OBESE],
        _ => vec![labels::OBESITY_NON_OBESE, labels::OBESITY_OVERWEIGHT],
    }
}

fn level_chain(bmi: Option<f64>) -> Vec<&'static str> {
    match bmi {
        Some(b) if b < BMI_THIN => vec![labels::LEVEL_THIN, labels::LEVEL_NORMAL],
        Some(b) if b < BMI_OVERWEIGHT => vec![labels::LEVEL_NORMAL, labels::LEVEL_THIN],
        Some(b) if b <= BMI_OBESE => vec![labels::LEVEL_OVERWEIGHT, labels::LEVEL_NORMAL],
        Some(_) => vec![labels::LEVEL_OBESE, labels::LEVEL_OVERWEIGHT],
        None => vec![labels::LEVEL_NORMAL],
    }
}

fn remap_muscularity(
    level: Option<f64>,
    bmi: Option<f64>,
    vocabulary: &SemanticVocabulary,
    flags: &mut Vec<String>,
) -> String {
    let sorted = vocabulary.muscularity_by_strength();
    let level = level.filter(|l| l.is_finite()).map(|l| l.clamp(0.0, 1.0));

    // Looks obese and not visibly muscular: the obesity signal wins
    if let (Some(b), Some(l)) = (bmi, level) {
        if b > BMI_OBESE && l < LOW_MUSCULARITY_LEVEL {
            flags.push("muscularity_forced_lowest_for_obesity".to_string());
            return sorted.first().map(|s| s.to_string()).unwrap_or_default();
        }
    }

    let level = level.unwrap_or(0.5);
    let order = labels::MUSCULARITY_ORDER;
    let chain: Vec<&str> = if level >= 0.8 {
        vec![order[4], order[3], order[2]]
    } else if level >= 0.6 {
        vec![order[3], order[2], order[4]]
    } else if level >= LOW_MUSCULARITY_LEVEL {
        vec![order[2], order[1]]
    } else if level >= 0.2 {
        vec![order[1], order[2]]
    } else {
        vec![order[0], order[1]]
    };

    if let Some(found) = chain.iter().find(|c| sorted.contains(c)) {
        return found.to_string();
    }

    // Reference data uses labels this build does not know: pick by quantile
    let idx = ((sorted.len().saturating_sub(1)) as f64 * level).round() as usize;
    sorted
        .get(idx.min(sorted.len().saturating_sub(1)))
        .map(|s| s.to_string())
        .unwrap_or_default()
}
