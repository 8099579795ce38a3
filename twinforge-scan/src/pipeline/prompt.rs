//! Prompt rendering for the vision model calls
//!
//! Every builder here is a pure function of its inputs. Keys are walked in
//! canonical sorted order and numbers use fixed formatting, so identical
//! inputs always render byte-identical text. Missing data renders as `N/A`
//! rather than failing.

use super::envelope::Envelope;
use super::measurements::{DeclaredBody, EnhancedMeasurements, RawMeasurements};
use super::semantic::{SemanticProfile, SemanticVocabulary};
use std::fmt::Write;
use twinforge_common::morph::vocabulary::{
    labels, ADIPOSITY_KEYS, HIP_KEYS, LIMB_KEYS, MORPH_VOCABULARY_VERSION, MUSCULAR_KEYS,
    RAW_SHAPE_MAX, RAW_SHAPE_MIN, SHAPE_KEYS, WAIST_KEYS,
};
use twinforge_common::morph::{LimbMassVector, MorphVector, PhysioBounds};
use twinforge_common::{BoundsRange, Gender};

/// Hip-to-shoulder ratio above which hips are biased upward
pub const WIDE_HIPS_RATIO: f64 = 1.1;
/// Waist-to-hip ratio above which belly fat is biased upward
pub const HIGH_WAIST_HIP_RATIO: f64 = 0.9;
/// Waist-to-hip ratio below which waist keys are biased upward
pub const LOW_WAIST_HIP_RATIO: f64 = 0.7;
/// Chest-to-waist ratio above which the upper body is biased upward
pub const V_TAPER_RATIO: f64 = 1.25;
/// Chest-to-waist ratio below which belly fat is biased upward
pub const FLAT_TAPER_RATIO: f64 = 1.05;

/// Share of a muscular key's envelope allowed at the lowest muscularity tiers
const LOW_MUSCULARITY_SHARE: f64 = 0.3;

/// JSON shape expected back from the refinement call
pub const REFINEMENT_REPLY_SCHEMA: &str = r#"{
  "final_shape_params": { "<shape key>": <number> },
  "final_limb_masses": { "<limb key>": <number> },
  "ai_confidence": <number between 0 and 1>,
  "refinement_notes": [ "<string>" ],
  "clamped_keys": [ "<key>" ],
  "envelope_violations": [ "<key>" ],
  "db_violations": [ "<key>" ],
  "out_of_range_count": <integer>
}"#;

/// Photo-derived anthropometric ratios
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BodyRatios {
    pub hip_to_shoulder: Option<f64>,
    pub waist_to_hip: Option<f64>,
    pub chest_to_waist: Option<f64>,
}

impl BodyRatios {
    pub fn from_measurements(m: &EnhancedMeasurements) -> Self {
        Self {
            hip_to_shoulder: ratio(m.hip_width_cm, m.shoulder_width_cm),
            waist_to_hip: ratio(m.waist_cm, m.hips_cm),
            chest_to_waist: ratio(m.chest_cm, m.waist_cm),
        }
    }

    /// Ratios from a partial measurement set; any missing side gives `None`
    pub fn from_partial(m: &RawMeasurements) -> Self {
        let pair = |a: Option<f64>, b: Option<f64>| a.zip(b).and_then(|(a, b)| ratio(a, b));
        Self {
            hip_to_shoulder: pair(m.hip_width_cm, m.shoulder_width_cm),
            waist_to_hip: pair(m.waist_cm, m.hips_cm),
            chest_to_waist: pair(m.chest_cm, m.waist_cm),
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    let r = numerator / denominator;
    (r.is_finite() && denominator > 0.0).then_some(r)
}

/// Everything the refinement prompt is rendered from
#[derive(Debug, Clone, Copy)]
pub struct RefinementContext<'a> {
    pub gender: Gender,
    pub profile: Option<&'a SemanticProfile>,
    pub muscularity_level: Option<f64>,
    pub bmi: Option<f64>,
    pub blend_shape_params: &'a MorphVector,
    pub blend_limb_masses: &'a LimbMassVector,
    pub envelope: &'a Envelope,
    pub bounds: &'a PhysioBounds,
    pub ratios: BodyRatios,
}

fn num(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.3}", v),
        _ => "N/A".to_string(),
    }
}

fn range(r: Option<BoundsRange>) -> String {
    match r {
        Some(r) => format!("[{}, {}]", num(Some(r.min)), num(Some(r.max))),
        None => "N/A".to_string(),
    }
}

/// Usable (non-banned) envelope range for a shape key
fn open_shape_range(ctx: &RefinementContext<'_>, key: &str) -> Option<BoundsRange> {
    ctx.envelope.shape_range(key).filter(|r| !r.is_banned())
}

/// Render the refinement instructions
pub fn build_refinement_prompt(ctx: &RefinementContext<'_>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Morph refinement");
    let _ = writeln!(out, "Gender: {}", ctx.gender);
    let _ = writeln!(out, "Vocabulary: {}", MORPH_VOCABULARY_VERSION);
    let _ = writeln!(
        out,
        "Archetypes: {}",
        if ctx.envelope.metadata.archetypes_used.is_empty() {
            "N/A".to_string()
        } else {
            ctx.envelope.metadata.archetypes_used.join(", ")
        }
    );
    out.push('\n');

    let _ = writeln!(out, "## Classification");
    let (obesity, muscularity, level, morphotype) = match ctx.profile {
        Some(p) => (
            p.obesity.as_str(),
            p.muscularity.as_str(),
            p.level.as_str(),
            p.morphotype.as_str(),
        ),
        None => ("N/A", "N/A", "N/A", "N/A"),
    };
    let _ = writeln!(out, "obesity: {}", obesity);
    let _ = writeln!(out, "muscularity: {}", muscularity);
    let _ = writeln!(out, "level: {}", level);
    let _ = writeln!(out, "morphotype: {}", morphotype);
    let _ = writeln!(out, "muscularity_level: {}", num(ctx.muscularity_level));
    let _ = writeln!(out, "bmi: {}", num(ctx.bmi));
    out.push('\n');

    let _ = writeln!(out, "## Photo ratios");
    let _ = writeln!(out, "hip_to_shoulder: {}", num(ctx.ratios.hip_to_shoulder));
    let _ = writeln!(out, "waist_to_hip: {}", num(ctx.ratios.waist_to_hip));
    let _ = writeln!(out, "chest_to_waist: {}", num(ctx.ratios.chest_to_waist));
    out.push('\n');

    let _ = writeln!(out, "## Shape parameters (key | blend | envelope | bounds)");
    for key in SHAPE_KEYS {
        let _ = writeln!(
            out,
            "{} | {} | {} | {}",
            key,
            num(ctx.blend_shape_params.get(*key).copied()),
            range(ctx.envelope.shape_range(key)),
            range(ctx.bounds.shape_params.get(*key).copied())
        );
    }
    out.push('\n');

    let _ = writeln!(out, "## Limb masses (key | blend | envelope | bounds)");
    for key in LIMB_KEYS {
        let _ = writeln!(
            out,
            "{} | {} | {} | {}",
            key,
            num(ctx.blend_limb_masses.get(*key).copied()),
            range(ctx.envelope.limb_range(key)),
            range(ctx.bounds.limb_masses.get(*key).copied())
        );
    }
    out.push('\n');

    let banned = ctx.bounds.banned_shape_keys();
    let _ = writeln!(out, "## Banned keys (must be exactly 0.000)");
    let _ = writeln!(out, "{}", if banned.is_empty() { "none".to_string() } else { banned.join(", ") });

    let fixed = ctx.bounds.fixed_shape_keys();
    let _ = writeln!(out, "## Fixed keys (must equal the value shown)");
    if fixed.is_empty() {
        let _ = writeln!(out, "none");
    }
    for (key, value) in fixed {
        let _ = writeln!(out, "{} = {}", key, num(Some(value)));
    }
    out.push('\n');

    let _ = writeln!(out, "## Rules");
    let _ = writeln!(
        out,
        "- Every value must stay inside its envelope range. Clamp any value you would place outside it."
    );
    let _ = writeln!(out, "- Start from the blend value and move only when the photos support it.");
    for rule in gating_rules(ctx).into_iter().chain(ratio_rules(ctx)) {
        let _ = writeln!(out, "- {}", rule);
    }
    out.push('\n');

    let _ = writeln!(out, "## Reply format");
    let _ = writeln!(out, "Reply with a single JSON object, no prose:");
    let _ = writeln!(out, "{}", REFINEMENT_REPLY_SCHEMA);

    out
}

/// Clauses derived from the muscularity and obesity labels
pub fn gating_rules(ctx: &RefinementContext<'_>) -> Vec<String> {
    let mut rules = Vec::new();
    let Some(profile) = ctx.profile else {
        rules.push("Classification N/A: apply no muscularity or adiposity gating.".to_string());
        return rules;
    };

    let rank = labels::muscularity_rank(&profile.muscularity);
    for key in MUSCULAR_KEYS {
        let Some(r) = open_shape_range(ctx, key) else {
            continue;
        };
        let span = r.max - r.min;
        if rank < 2.0 {
            rules.push(format!(
                "Muscularity \"{}\": keep {} within [{}, {}] (lower 30% of envelope).",
                profile.muscularity,
                key,
                num(Some(r.min)),
                num(Some(r.min + span * LOW_MUSCULARITY_SHARE))
            ));
        } else if rank < 3.0 {
            rules.push(format!(
                "Muscularity \"{}\": keep {} at or below the envelope midpoint {}.",
                profile.muscularity,
                key,
                num(Some(r.min + span / 2.0))
            ));
        } else if rank >= 4.0 {
            rules.push(format!(
                "Muscularity \"{}\": bias {} toward the upper envelope bound {}.",
                profile.muscularity,
                key,
                num(Some(r.max))
            ));
        } else {
            rules.push(format!(
                "Muscularity \"{}\": {} may use its full envelope.",
                profile.muscularity, key
            ));
        }
    }

    let obesity = profile.obesity.as_str();
    for key in ADIPOSITY_KEYS {
        let Some(r) = open_shape_range(ctx, key) else {
            continue;
        };
        let mid = num(Some(r.min + (r.max - r.min) / 2.0));
        match obesity {
            labels::OBESITY_OBESE => rules.push(format!(
                "Obesity \"{}\": keep {} in the upper half of its envelope (at least {}).",
                obesity, key, mid
            )),
            labels::OBESITY_NON_OBESE => rules.push(format!(
                "Obesity \"{}\": keep {} at or below the envelope midpoint {}.",
                obesity, key, mid
            )),
            _ => {}
        }
    }
    if obesity != labels::OBESITY_NON_OBESE {
        if let Some(r) = open_shape_range(ctx, "emaciated") {
            rules.push(format!(
                "Obesity \"{}\": keep emaciated at its envelope minimum {}.",
                obesity,
                num(Some(r.min))
            ));
        }
    }

    rules
}

/// Clauses derived from photo ratios
pub fn ratio_rules(ctx: &RefinementContext<'_>) -> Vec<String> {
    let mut rules = Vec::new();
    let bias_up = |keys: &[&str], reason: String, rules: &mut Vec<String>| {
        let open: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| open_shape_range(ctx, k).is_some())
            .collect();
        if !open.is_empty() {
            rules.push(format!("{}: bias {} toward the upper envelope bound.", reason, open.join(", ")));
        }
    };

    if let Some(r) = ctx.ratios.hip_to_shoulder {
        if r > WIDE_HIPS_RATIO {
            bias_up(
                HIP_KEYS,
                format!("Hip-to-shoulder ratio {} > {:.2}", num(Some(r)), WIDE_HIPS_RATIO),
                &mut rules,
            );
        }
    }

    if let Some(r) = ctx.ratios.waist_to_hip {
        if r > HIGH_WAIST_HIP_RATIO {
            bias_up(
                &["bellyFat"][..],
                format!("Waist-to-hip ratio {} > {:.2}", num(Some(r)), HIGH_WAIST_HIP_RATIO),
                &mut rules,
            );
        } else if r < LOW_WAIST_HIP_RATIO {
            bias_up(
                WAIST_KEYS,
                format!("Waist-to-hip ratio {} < {:.2}", num(Some(r)), LOW_WAIST_HIP_RATIO),
                &mut rules,
            );
        }
    }

    if let Some(r) = ctx.ratios.chest_to_waist {
        if r > V_TAPER_RATIO {
            let keys: Vec<&str> = std::iter::once("shoulderWidth").chain(MUSCULAR_KEYS.iter().copied()).collect();
            bias_up(
                keys.as_slice(),
                format!("Chest-to-waist ratio {} > {:.2}", num(Some(r)), V_TAPER_RATIO),
                &mut rules,
            );
        } else if r < FLAT_TAPER_RATIO {
            bias_up(
                &["bellyFat"][..],
                format!("Chest-to-waist ratio {} < {:.2}", num(Some(r)), FLAT_TAPER_RATIO),
                &mut rules,
            );
        }
    }

    rules
}

/// Instructions for the measurement extraction call
pub fn build_estimate_prompt(declared: &DeclaredBody, views: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Body measurement extraction");
    let _ = writeln!(out, "Declared gender: {}", declared.gender);
    let _ = writeln!(out, "Declared height_cm: {}", num(Some(declared.height_cm)));
    let _ = writeln!(out, "Declared weight_kg: {}", num(Some(declared.weight_kg)));
    let _ = writeln!(
        out,
        "Photo views: {}",
        if views.is_empty() { "N/A".to_string() } else { views.join(", ") }
    );
    out.push('\n');
    let _ = writeln!(
        out,
        "Measure the subject from the photos. Use any visible reference object to derive pixel_per_cm; \
         leave a field null when it cannot be measured. Do not guess from the declared values."
    );
    out.push('\n');
    let _ = writeln!(out, "Reply with a single JSON object, no prose:");
    let _ = writeln!(
        out,
        r#"{{
  "raw_measurements": {{
    "chest_cm": <number|null>, "waist_cm": <number|null>, "hips_cm": <number|null>,
    "shoulder_width_cm": <number|null>, "hip_width_cm": <number|null>,
    "pixel_per_cm": <number|null>, "body_height_px": <number|null>
  }},
  "skin_tone": {{ "r": <0-255>, "g": <0-255>, "b": <0-255> }} | null,
  "keypoints": [ {{ "name": "<string>", "x": <number>, "y": <number> }} ],
  "confidence": <number between 0 and 1>
}}"#
    );
    out
}

/// Instructions for the semantic classification call
pub fn build_semantic_prompt(gender: Gender, bmi: Option<f64>, vocabulary: &SemanticVocabulary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Body classification");
    let _ = writeln!(out, "Gender: {}", gender);
    let _ = writeln!(out, "BMI: {}", num(bmi));
    out.push('\n');
    let _ = writeln!(out, "Pick exactly one label per category from these lists:");
    let _ = writeln!(out, "obesity: {}", vocabulary.obesity.join(" | "));
    let _ = writeln!(out, "muscularity: {}", vocabulary.muscularity.join(" | "));
    let _ = writeln!(out, "level: {}", vocabulary.level.join(" | "));
    let _ = writeln!(out, "morphotype: {}", vocabulary.morphotype.join(" | "));
    out.push('\n');
    let _ = writeln!(
        out,
        "Also score muscularity_level and adiposity_level from 0 to 1, and estimate raw morph values \
         in [{:.1}, {:.1}] for these keys: {}",
        RAW_SHAPE_MIN,
        RAW_SHAPE_MAX,
        SHAPE_KEYS.join(", ")
    );
    out.push('\n');
    let _ = writeln!(out, "Reply with a single JSON object, no prose:");
    let _ = writeln!(
        out,
        r#"{{
  "obesity": "<label>", "muscularity": "<label>", "level": "<label>", "morphotype": "<label>",
  "muscularity_level": <number>, "adiposity_level": <number>,
  "region_scores": {{ "<region>": <number> }},
  "confidence": <number between 0 and 1>,
  "morph_values": {{ "<shape key>": <number> }}
}}"#
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bounds::compute_bounds;
    use crate::pipeline::envelope::build_envelope;
    use twinforge_common::db::bundled_archetypes;

    struct Fixture {
        bounds: PhysioBounds,
        envelope: Envelope,
        blend_shape: MorphVector,
        blend_limbs: LimbMassVector,
        profile: SemanticProfile,
    }

    fn fixture(gender: Gender, muscularity: &str, obesity: &str) -> Fixture {
        let all = bundled_archetypes().unwrap();
        let bounds = compute_bounds(&all, gender);
        let rows: Vec<_> = all.into_iter().filter(|a| a.gender == gender).take(5).collect();
        let envelope = build_envelope(&rows, &bounds);
        let blend_shape = rows[0].morph_values.clone();
        let blend_limbs = rows[0].limb_masses.clone();
        Fixture {
            bounds,
            envelope,
            blend_shape,
            blend_limbs,
            profile: SemanticProfile {
                obesity: obesity.to_string(),
                muscularity: muscularity.to_string(),
                level: "Normal".to_string(),
                morphotype: "REC".to_string(),
            },
        }
    }

    fn context<'a>(f: &'a Fixture, gender: Gender, ratios: BodyRatios) -> RefinementContext<'a> {
        RefinementContext {
            gender,
            profile: Some(&f.profile),
            muscularity_level: Some(0.5),
            bmi: Some(24.0),
            blend_shape_params: &f.blend_shape,
            blend_limb_masses: &f.blend_limbs,
            envelope: &f.envelope,
            bounds: &f.bounds,
            ratios,
        }
    }

    #[test]
    fn test_prompt_is_idempotent() {
        let f = fixture(Gender::Feminine, "Normal", "Non obèse");
        let ratios = BodyRatios {
            hip_to_shoulder: Some(1.2),
            waist_to_hip: Some(0.68),
            chest_to_waist: Some(1.3),
        };
        let a = build_refinement_prompt(&context(&f, Gender::Feminine, ratios));
        let b = build_refinement_prompt(&context(&f, Gender::Feminine, ratios));
        assert_eq!(a, b);
    }

    #[test]
    fn test_wide_hips_bias_clause() {
        let f = fixture(Gender::Feminine, "Normal", "Non obèse");
        let ratios = BodyRatios {
            hip_to_shoulder: Some(1.15),
            ..Default::default()
        };
        let prompt = build_refinement_prompt(&context(&f, Gender::Feminine, ratios));
        assert!(prompt.contains("Hip-to-shoulder ratio 1.150 > 1.10: bias assLarge, bigHips, pearFigure toward the upper envelope bound."));

        let narrow = BodyRatios {
            hip_to_shoulder: Some(1.05),
            ..Default::default()
        };
        let prompt = build_refinement_prompt(&context(&f, Gender::Feminine, narrow));
        assert!(!prompt.contains("Hip-to-shoulder ratio"));
    }

    #[test]
    fn test_banned_keys_listed_and_skipped_by_heuristics() {
        let f = fixture(Gender::Masculine, "Normal", "Non obèse");
        let ratios = BodyRatios {
            hip_to_shoulder: Some(1.3),
            ..Default::default()
        };
        let prompt = build_refinement_prompt(&context(&f, Gender::Masculine, ratios));
        let banned_line = prompt
            .lines()
            .skip_while(|l| !l.starts_with("## Banned keys"))
            .nth(1)
            .unwrap();
        assert!(banned_line.contains("pregnant"));
        // assLarge and pearFigure are banned for masculine rows
        assert!(prompt.contains("bias bigHips toward the upper envelope bound"));
    }

    #[test]
    fn test_low_muscularity_gates_to_lower_share() {
        let f = fixture(Gender::Masculine, "Normal", "Non obèse");
        let prompt = build_refinement_prompt(&context(&f, Gender::Masculine, BodyRatios::default()));
        assert!(prompt.contains("keep muscleMass within"));
        assert!(prompt.contains("(lower 30% of envelope)"));
    }

    #[test]
    fn test_high_muscularity_biases_upward() {
        let f = fixture(Gender::Masculine, "Très musclé", "Non obèse");
        let rules = gating_rules(&context(&f, Gender::Masculine, BodyRatios::default()));
        assert!(rules.iter().any(|r| r.contains("bias muscleMass toward the upper envelope bound")));
    }

    #[test]
    fn test_obese_gates_adiposity_and_emaciated() {
        let f = fixture(Gender::Masculine, "Normal", "Obèse");
        let rules = gating_rules(&context(&f, Gender::Masculine, BodyRatios::default()));
        assert!(rules.iter().any(|r| r.contains("keep bellyFat in the upper half")));
        assert!(rules.iter().any(|r| r.contains("keep emaciated at its envelope minimum")));
    }

    #[test]
    fn test_missing_data_renders_placeholders() {
        let bounds = PhysioBounds::default();
        let envelope = Envelope::default();
        let empty = MorphVector::new();
        let ctx = RefinementContext {
            gender: Gender::Feminine,
            profile: None,
            muscularity_level: None,
            bmi: Some(f64::NAN),
            blend_shape_params: &empty,
            blend_limb_masses: &empty,
            envelope: &envelope,
            bounds: &bounds,
            ratios: BodyRatios::default(),
        };
        let prompt = build_refinement_prompt(&ctx);
        assert!(prompt.contains("bmi: N/A"));
        assert!(prompt.contains("bigHips | N/A | N/A | N/A"));
        assert!(prompt.contains("Classification N/A"));
        assert!(prompt.contains("\"final_limb_masses\""));
    }

    #[test]
    fn test_ratio_guards_zero_denominator() {
        assert_eq!(ratio(10.0, 0.0), None);
        assert_eq!(ratio(f64::NAN, 2.0), None);
        assert_eq!(ratio(3.0, 2.0), Some(1.5));
    }

    #[test]
    fn test_semantic_prompt_lists_vocabulary() {
        let prompt = build_semantic_prompt(Gender::Masculine, Some(31.2), &SemanticVocabulary::defaults());
        assert!(prompt.contains("obesity: Non obèse | Surpoids | Obèse"));
        assert!(prompt.contains("BMI: 31.200"));
    }
}
