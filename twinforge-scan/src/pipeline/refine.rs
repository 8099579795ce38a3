//! Refinement reply parsing and post-parse clamping
//!
//! The model is told to keep every value inside the envelope, but its reply
//! is never trusted for range compliance. After the structural parse,
//! [`clamp_to_envelope`] clamps each value into the envelope and the DB
//! bounds independently and records what it had to change.

use super::envelope::Envelope;
use super::reply::{
    optional_number, optional_string_list, parse_json_object, required_number_map, ReplyError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};
use twinforge_common::morph::vocabulary::{LIMB_KEYS, LIMB_MASS_DEFAULT, SHAPE_KEYS};
use twinforge_common::morph::{LimbMassVector, MorphVector, PhysioBounds};
use twinforge_common::BoundsRange;

/// Refinement reply after structural validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementReply {
    pub final_shape_params: MorphVector,
    pub final_limb_masses: LimbMassVector,
    pub ai_confidence: f64,
    pub refinement_notes: Vec<String>,
    /// Keys the model reports having clamped itself
    pub clamped_keys: Vec<String>,
    pub envelope_violations: Vec<String>,
    pub db_violations: Vec<String>,
    pub out_of_range_count: Option<f64>,
}

/// Parse the model's refinement reply
///
/// Both vectors are required; any other field defaults when absent.
pub fn parse_refinement_reply(text: &str) -> Result<RefinementReply, ReplyError> {
    let obj = parse_json_object(text)?;

    let final_shape_params = required_number_map(&obj, "final_shape_params")?;
    let final_limb_masses = required_number_map(&obj, "final_limb_masses")?;
    let ai_confidence = optional_number(&obj, "ai_confidence")?
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.0);

    Ok(RefinementReply {
        final_shape_params,
        final_limb_masses,
        ai_confidence,
        refinement_notes: optional_string_list(&obj, "refinement_notes")?,
        clamped_keys: optional_string_list(&obj, "clamped_keys")?,
        envelope_violations: optional_string_list(&obj, "envelope_violations")?,
        db_violations: optional_string_list(&obj, "db_violations")?,
        out_of_range_count: optional_number(&obj, "out_of_range_count")?,
    })
}

/// A value found outside its admissible range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub key: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Result of the post-parse clamp
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClampOutcome {
    pub final_shape_params: MorphVector,
    pub final_limb_masses: LimbMassVector,
    pub clamped_keys: Vec<String>,
    pub envelope_violations: Vec<Violation>,
    pub db_violations: Vec<Violation>,
    pub out_of_range_count: usize,
    pub dropped_keys: Vec<String>,
    pub filled_keys: Vec<String>,
}

/// Clamp model output into the envelope and the DB bounds
///
/// Non-canonical keys are dropped. Keys the model omitted are filled from
/// the blend, or from the neutral value when the blend lacks them too; the
/// filled value is clamped like any other. Banned keys always end at 0.
pub fn clamp_to_envelope(
    reply_shape: &MorphVector,
    reply_limbs: &LimbMassVector,
    blend_shape: &MorphVector,
    blend_limbs: &LimbMassVector,
    envelope: &Envelope,
    bounds: &PhysioBounds,
) -> ClampOutcome {
    let mut outcome = ClampOutcome::default();

    let final_shape_params = clamp_section(
        SHAPE_KEYS,
        reply_shape,
        blend_shape,
        0.0,
        |k| envelope.shape_range(k),
        &bounds.shape_params,
        &mut outcome,
    );
    let final_limb_masses = clamp_section(
        LIMB_KEYS,
        reply_limbs,
        blend_limbs,
        LIMB_MASS_DEFAULT,
        |k| envelope.limb_range(k),
        &bounds.limb_masses,
        &mut outcome,
    );
    outcome.final_shape_params = final_shape_params;
    outcome.final_limb_masses = final_limb_masses;

    outcome.out_of_range_count = outcome
        .envelope_violations
        .iter()
        .chain(&outcome.db_violations)
        .map(|v| v.key.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    if !outcome.clamped_keys.is_empty() || !outcome.dropped_keys.is_empty() {
        warn!(
            clamped = ?outcome.clamped_keys,
            dropped = ?outcome.dropped_keys,
            out_of_range = outcome.out_of_range_count,
            "Refinement output adjusted after parse"
        );
    } else {
        debug!(filled = outcome.filled_keys.len(), "Refinement output within ranges");
    }

    outcome
}

fn clamp_section<F>(
    keys: &[&str],
    reply: &BTreeMap<String, f64>,
    blend: &BTreeMap<String, f64>,
    neutral: f64,
    envelope_range: F,
    db: &BTreeMap<String, BoundsRange>,
    outcome: &mut ClampOutcome,
) -> BTreeMap<String, f64>
where
    F: Fn(&str) -> Option<BoundsRange>,
{
    for key in reply.keys() {
        if !keys.iter().any(|k| *k == key.as_str()) {
            outcome.dropped_keys.push(key.clone());
        }
    }

    let mut out = BTreeMap::new();
    for key in keys {
        let raw = match reply.get(*key).filter(|v| v.is_finite()) {
            Some(v) => *v,
            None => {
                outcome.filled_keys.push(key.to_string());
                blend.get(*key).copied().filter(|v| v.is_finite()).unwrap_or(neutral)
            }
        };

        let mut value = raw;
        if let Some(r) = envelope_range(*key) {
            if !r.contains(value) {
                outcome.envelope_violations.push(violation(key, value, r));
                value = r.clamp(value);
            }
        }
        // The envelope may be client-supplied; DB bounds are the final word
        if let Some(r) = db.get(*key) {
            if !r.contains(value) {
                outcome.db_violations.push(violation(key, value, *r));
                value = r.clamp(value);
            }
        }

        if value != raw {
            outcome.clamped_keys.push(key.to_string());
        }
        out.insert(key.to_string(), value);
    }
    out
}

fn violation(key: &str, value: f64, r: BoundsRange) -> Violation {
    Violation {
        key: key.to_string(),
        value,
        min: r.min,
        max: r.max,
    }
}

/// Force banned shape keys to 0 and drop non-canonical keys
///
/// Run once more on the vectors handed to persistence.
pub fn enforce_banned_keys(shape: &MorphVector, bounds: &PhysioBounds) -> (MorphVector, Vec<String>) {
    let mut changed = Vec::new();
    let out = shape
        .iter()
        .filter(|(k, _)| bounds.shape_params.contains_key(k.as_str()))
        .map(|(k, v)| {
            let banned = bounds.shape_params.get(k.as_str()).is_some_and(|r| r.is_banned());
            if banned && *v != 0.0 {
                changed.push(k.clone());
                (k.clone(), 0.0)
            } else {
                (k.clone(), *v)
            }
        })
        .collect();
    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bounds::compute_bounds;
    use crate::pipeline::envelope::build_envelope;
    use twinforge_common::db::bundled_archetypes;
    use twinforge_common::Gender;

    fn masculine() -> (PhysioBounds, Envelope) {
        let all = bundled_archetypes().unwrap();
        let bounds = compute_bounds(&all, Gender::Masculine);
        let rows: Vec<_> = all.into_iter().filter(|a| a.gender == Gender::Masculine).take(5).collect();
        let envelope = build_envelope(&rows, &bounds);
        (bounds, envelope)
    }

    #[test]
    fn test_missing_final_limb_masses_is_named_error() {
        let err = parse_refinement_reply(r#"{"final_shape_params": {"bigHips": 0.2}}"#).unwrap_err();
        assert_eq!(err, ReplyError::MissingField("final_limb_masses".to_string()));
        assert!(err.to_string().contains("final_limb_masses"));
    }

    #[test]
    fn test_missing_final_shape_params_is_named_error() {
        let err = parse_refinement_reply(r#"{"final_limb_masses": {}}"#).unwrap_err();
        assert_eq!(err.field(), Some("final_shape_params"));
    }

    #[test]
    fn test_parse_fenced_reply_with_defaults() {
        let text = "```json\n{\"final_shape_params\": {\"bigHips\": 0.2}, \"final_limb_masses\": {\"armMass\": 1.1}, \"ai_confidence\": 1.7}\n```";
        let reply = parse_refinement_reply(text).unwrap();
        assert_eq!(reply.ai_confidence, 1.0);
        assert!(reply.refinement_notes.is_empty());
        assert!(reply.clamped_keys.is_empty());
        assert_eq!(reply.final_limb_masses["armMass"], 1.1);
    }

    #[test]
    fn test_negative_confidence_clamped_to_zero() {
        let reply = parse_refinement_reply(
            r#"{"final_shape_params": {}, "final_limb_masses": {}, "ai_confidence": -0.4}"#,
        )
        .unwrap();
        assert_eq!(reply.ai_confidence, 0.0);
    }

    #[test]
    fn test_masculine_pregnant_clamped_to_zero() {
        let (bounds, envelope) = masculine();
        assert_eq!(bounds.shape_params["pregnant"], BoundsRange::point(0.0));

        let mut shape = MorphVector::new();
        shape.insert("pregnant".to_string(), 1.5);
        let outcome = clamp_to_envelope(
            &shape,
            &LimbMassVector::new(),
            &MorphVector::new(),
            &LimbMassVector::new(),
            &envelope,
            &bounds,
        );

        assert_eq!(outcome.final_shape_params["pregnant"], 0.0);
        assert!(outcome.clamped_keys.contains(&"pregnant".to_string()));
        assert!(outcome.envelope_violations.iter().any(|v| v.key == "pregnant"));
    }

    #[test]
    fn test_every_key_lands_inside_bounds() {
        let (bounds, envelope) = masculine();
        for value in [-50.0, -1.0, 0.0, 0.5, 1.0, 3.0, 50.0] {
            let shape: MorphVector = SHAPE_KEYS.iter().map(|k| (k.to_string(), value)).collect();
            let limbs: LimbMassVector = LIMB_KEYS.iter().map(|k| (k.to_string(), value)).collect();
            let outcome = clamp_to_envelope(&shape, &limbs, &shape, &limbs, &envelope, &bounds);

            for (key, v) in &outcome.final_shape_params {
                assert!(bounds.shape_params[key].contains(*v), "{} = {}", key, v);
                assert!(envelope.shape_range(key).unwrap().contains(*v));
                if bounds.shape_params[key].is_banned() {
                    assert_eq!(*v, 0.0);
                }
            }
            for (key, v) in &outcome.final_limb_masses {
                assert!(bounds.limb_masses[key].contains(*v));
            }
        }
    }

    #[test]
    fn test_unknown_keys_dropped_and_missing_filled() {
        let (bounds, envelope) = masculine();
        let mut shape = MorphVector::new();
        shape.insert("wings".to_string(), 0.4);
        let mut blend = MorphVector::new();
        blend.insert("bigHips".to_string(), 0.05);

        let outcome = clamp_to_envelope(&shape, &LimbMassVector::new(), &blend, &LimbMassVector::new(), &envelope, &bounds);

        assert_eq!(outcome.dropped_keys, vec!["wings".to_string()]);
        assert!(!outcome.final_shape_params.contains_key("wings"));
        assert_eq!(outcome.final_shape_params["bigHips"], 0.05);
        assert_eq!(outcome.final_shape_params.len(), SHAPE_KEYS.len());
        assert_eq!(outcome.final_limb_masses.len(), LIMB_KEYS.len());
        assert!(outcome.filled_keys.contains(&"bigHips".to_string()));
    }

    #[test]
    fn test_client_envelope_cannot_widen_db_bounds() {
        let (bounds, _) = masculine();
        let mut envelope = Envelope::from_bounds(&bounds);
        if let Some(e) = envelope.shape_params.get_mut("pregnant") {
            e.min = 0.0;
            e.max = 2.0;
        }
        let mut shape: MorphVector = bounds.shape_params.iter().map(|(k, r)| (k.clone(), r.min)).collect();
        shape.insert("pregnant".to_string(), 1.5);
        let limbs: LimbMassVector = bounds.limb_masses.iter().map(|(k, r)| (k.clone(), r.min)).collect();

        let outcome = clamp_to_envelope(&shape, &limbs, &shape, &limbs, &envelope, &bounds);

        assert_eq!(outcome.final_shape_params["pregnant"], 0.0);
        assert_eq!(outcome.db_violations.len(), 1);
        assert_eq!(outcome.out_of_range_count, 1);
    }

    #[test]
    fn test_enforce_banned_keys() {
        let (bounds, _) = masculine();
        let mut shape = MorphVector::new();
        shape.insert("pregnant".to_string(), 0.8);
        shape.insert("bigHips".to_string(), 0.1);
        shape.insert("tail".to_string(), 1.0);

        let (out, changed) = enforce_banned_keys(&shape, &bounds);
        assert_eq!(out["pregnant"], 0.0);
        assert_eq!(out["bigHips"], 0.1);
        assert!(!out.contains_key("tail"));
        assert_eq!(changed, vec!["pregnant".to_string()]);
    }
}
