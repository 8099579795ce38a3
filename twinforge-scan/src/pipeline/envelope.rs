//! K=5 envelope construction
//!
//! The envelope is the per-key interval the refinement step may move a value
//! in. It is the span of values seen across the selected archetypes,
//! intersected with the physiological bounds. Whatever the archetype input,
//! every envelope range lies inside the corresponding bounds range and banned
//! keys stay banned.

use super::bounds::extrema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use twinforge_common::morph::{Archetype, PhysioBounds};
use twinforge_common::BoundsRange;

/// Number of nearest archetypes an envelope is built from
pub const ENVELOPE_K: usize = 5;

/// Where an envelope range came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeSource {
    Archetype,
    DbFallback,
    Banned,
}

/// Admissible interval for one key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeRange {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype_max: Option<f64>,
    pub source: EnvelopeSource,
}

impl EnvelopeRange {
    pub fn range(&self) -> BoundsRange {
        BoundsRange::new(self.min, self.max)
    }

    fn db_fallback(db: BoundsRange) -> Self {
        Self {
            min: db.min,
            max: db.max,
            archetype_min: None,
            archetype_max: None,
            source: if db.is_banned() {
                EnvelopeSource::Banned
            } else {
                EnvelopeSource::DbFallback
            },
        }
    }

    /// Clamp archetype extrema into the DB range
    fn from_archetypes(observed: BoundsRange, db: BoundsRange) -> Self {
        if db.is_banned() {
            return Self {
                archetype_min: Some(observed.min),
                archetype_max: Some(observed.max),
                ..Self::db_fallback(db)
            };
        }
        let clamped = observed.intersect_within(&db);
        Self {
            min: clamped.min,
            max: clamped.max,
            archetype_min: Some(observed.min),
            archetype_max: Some(observed.max),
            source: EnvelopeSource::Archetype,
        }
    }
}

/// Provenance and counts for an envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub archetypes_used: Vec<String>,
    pub keys_with_archetype_data: usize,
    pub keys_with_db_fallback: usize,
    pub banned_keys: Vec<String>,
}

/// Per-key admissible intervals for shape params and limb masses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub shape_params: BTreeMap<String, EnvelopeRange>,
    pub limb_masses: BTreeMap<String, EnvelopeRange>,
    #[serde(default)]
    pub metadata: EnvelopeMetadata,
}

/// Build the envelope from the selected archetypes
///
/// Only the first [`ENVELOPE_K`] archetypes are used. Selection and ranking
/// happen upstream.
pub fn build_envelope(archetypes: &[Archetype], bounds: &PhysioBounds) -> Envelope {
    if archetypes.len() > ENVELOPE_K {
        warn!(
            provided = archetypes.len(),
            k = ENVELOPE_K,
            "More archetypes than envelope size, truncating"
        );
    }
    let selected = &archetypes[..archetypes.len().min(ENVELOPE_K)];

    let shape_params = build_section(&bounds.shape_params, |key| {
        extrema(selected.iter().filter_map(|a| a.morph_values.get(key).copied()))
    });
    let limb_masses = build_section(&bounds.limb_masses, |key| {
        extrema(selected.iter().filter_map(|a| a.limb_masses.get(key).copied()))
    });

    let mut envelope = Envelope {
        shape_params,
        limb_masses,
        metadata: EnvelopeMetadata {
            archetypes_used: selected.iter().map(|a| a.id.clone()).collect(),
            ..Default::default()
        },
    };
    envelope.refresh_counts();

    debug!(
        archetypes = ?envelope.metadata.archetypes_used,
        with_data = envelope.metadata.keys_with_archetype_data,
        fallback = envelope.metadata.keys_with_db_fallback,
        banned = envelope.metadata.banned_keys.len(),
        "Envelope built"
    );

    envelope
}

fn build_section<F>(db: &BTreeMap<String, BoundsRange>, observed: F) -> BTreeMap<String, EnvelopeRange>
where
    F: Fn(&str) -> Option<BoundsRange>,
{
    db.iter()
        .map(|(key, db_range)| {
            let entry = match observed(key) {
                Some(obs) => EnvelopeRange::from_archetypes(obs, *db_range),
                None => EnvelopeRange::db_fallback(*db_range),
            };
            (key.clone(), entry)
        })
        .collect()
}

impl Envelope {
    /// Envelope equal to the DB bounds, used when no archetypes are available
    pub fn from_bounds(bounds: &PhysioBounds) -> Self {
        build_envelope(&[], bounds)
    }

    /// Re-intersect an externally supplied envelope with the DB bounds
    ///
    /// Keys absent from the bounds are dropped; keys absent from the envelope
    /// fall back to the bounds. Provenance from the original is kept.
    pub fn constrain_to(&self, bounds: &PhysioBounds) -> Envelope {
        let constrain = |own: &BTreeMap<String, EnvelopeRange>, db: &BTreeMap<String, BoundsRange>| {
            db.iter()
                .map(|(key, db_range)| {
                    let entry = match own.get(key) {
                        Some(_) if db_range.is_banned() => EnvelopeRange::db_fallback(*db_range),
                        Some(e) if e.min.is_finite() && e.max.is_finite() => {
                            let r = e.range().intersect_within(db_range);
                            EnvelopeRange {
                                min: r.min,
                                max: r.max,
                                source: match e.source {
                                    EnvelopeSource::Banned => EnvelopeSource::DbFallback,
                                    other => other,
                                },
                                ..*e
                            }
                        }
                        _ => EnvelopeRange::db_fallback(*db_range),
                    };
                    (key.clone(), entry)
                })
                .collect::<BTreeMap<_, _>>()
        };

        let mut envelope = Envelope {
            shape_params: constrain(&self.shape_params, &bounds.shape_params),
            limb_masses: constrain(&self.limb_masses, &bounds.limb_masses),
            metadata: EnvelopeMetadata {
                archetypes_used: self.metadata.archetypes_used.clone(),
                ..Default::default()
            },
        };
        envelope.refresh_counts();
        envelope
    }

    pub fn shape_range(&self, key: &str) -> Option<BoundsRange> {
        self.shape_params.get(key).map(EnvelopeRange::range)
    }

    pub fn limb_range(&self, key: &str) -> Option<BoundsRange> {
        self.limb_masses.get(key).map(EnvelopeRange::range)
    }

    /// True when every range sits inside the bounds
    pub fn is_within(&self, bounds: &PhysioBounds) -> bool {
        let section_ok = |own: &BTreeMap<String, EnvelopeRange>, db: &BTreeMap<String, BoundsRange>| {
            own.iter().all(|(key, e)| match db.get(key) {
                Some(db_range) => e.range().is_within(db_range) && e.min <= e.max,
                None => false,
            })
        };
        section_ok(&self.shape_params, &bounds.shape_params)
            && section_ok(&self.limb_masses, &bounds.limb_masses)
    }

    fn refresh_counts(&mut self) {
        let all = || self.shape_params.values().chain(self.limb_masses.values());
        let keys_with_archetype_data = all().filter(|e| e.source == EnvelopeSource::Archetype).count();
        let keys_with_db_fallback = all().filter(|e| e.source == EnvelopeSource::DbFallback).count();
        let banned_keys = self
            .shape_params
            .iter()
            .filter(|(_, e)| e.source == EnvelopeSource::Banned)
            .map(|(k, _)| k.clone())
            .collect();

        self.metadata.keys_with_archetype_data = keys_with_archetype_data;
        self.metadata.keys_with_db_fallback = keys_with_db_fallback;
        self.metadata.banned_keys = banned_keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bounds::compute_bounds;
    use twinforge_common::db::bundled_archetypes;
    use twinforge_common::morph::MorphVector;
    use twinforge_common::Gender;

    fn archetype(id: &str, values: &[(&str, f64)]) -> Archetype {
        Archetype {
            id: id.to_string(),
            name: id.to_string(),
            gender: Gender::Masculine,
            obesity: "Non obèse".to_string(),
            muscularity: "Normal".to_string(),
            level: "Normal".to_string(),
            morphotype: "REC".to_string(),
            bmi: Some(23.0),
            morph_values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect::<MorphVector>(),
            limb_masses: Default::default(),
            measurements: None,
        }
    }

    fn bounds(entries: &[(&str, f64, f64)]) -> PhysioBounds {
        PhysioBounds {
            shape_params: entries
                .iter()
                .map(|(k, a, b)| (k.to_string(), BoundsRange::new(*a, *b)))
                .collect(),
            limb_masses: Default::default(),
        }
    }

    #[test]
    fn test_archetype_extrema_clamped_into_db() {
        let db = bounds(&[("bigHips", 0.0, 1.0)]);
        let arch = [archetype("a", &[("bigHips", -0.5)]), archetype("b", &[("bigHips", 0.6)])];
        let env = build_envelope(&arch, &db);

        let e = env.shape_params["bigHips"];
        assert_eq!((e.min, e.max), (0.0, 0.6));
        assert_eq!(e.archetype_min, Some(-0.5));
        assert_eq!(e.source, EnvelopeSource::Archetype);
    }

    #[test]
    fn test_missing_archetype_data_falls_back_to_db() {
        let db = bounds(&[("bigHips", 0.0, 1.0), ("narrowWaist", 0.1, 0.9)]);
        let env = build_envelope(&[archetype("a", &[("bigHips", 0.3)])], &db);

        let e = env.shape_params["narrowWaist"];
        assert_eq!((e.min, e.max), (0.1, 0.9));
        assert_eq!(e.source, EnvelopeSource::DbFallback);
        assert_eq!(env.metadata.keys_with_db_fallback, 1);
        assert_eq!(env.metadata.keys_with_archetype_data, 1);
    }

    #[test]
    fn test_banned_keys_preserved_regardless_of_archetypes() {
        let db = bounds(&[("pregnant", 0.0, 0.0)]);
        let env = build_envelope(&[archetype("a", &[("pregnant", 1.5)])], &db);

        let e = env.shape_params["pregnant"];
        assert_eq!((e.min, e.max), (0.0, 0.0));
        assert_eq!(e.source, EnvelopeSource::Banned);
        assert_eq!(env.metadata.banned_keys, vec!["pregnant".to_string()]);
    }

    #[test]
    fn test_only_first_k_archetypes_used() {
        let db = bounds(&[("bigHips", -3.0, 3.0)]);
        let arch: Vec<_> = (0..7)
            .map(|i| archetype(&format!("a{}", i), &[("bigHips", i as f64 * 0.1)]))
            .collect();
        let env = build_envelope(&arch, &db);

        assert_eq!(env.metadata.archetypes_used.len(), ENVELOPE_K);
        assert!((env.shape_params["bigHips"].max - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_envelope_within_bounds_for_seed_data() {
        let all = bundled_archetypes().unwrap();
        for gender in [Gender::Masculine, Gender::Feminine] {
            let db = compute_bounds(&all, gender);
            let rows: Vec<_> = all.iter().filter(|a| a.gender == gender).cloned().collect();
            for window in rows.windows(ENVELOPE_K.min(rows.len())) {
                let env = build_envelope(window, &db);
                assert!(env.is_within(&db));
                for (key, db_range) in &db.shape_params {
                    if db_range.is_banned() {
                        assert_eq!(env.shape_range(key), Some(BoundsRange::point(0.0)));
                    }
                }
            }
        }
    }

    #[test]
    fn test_envelope_within_bounds_for_adversarial_values() {
        let db = bounds(&[("bigHips", 0.0, 1.0), ("pregnant", 0.0, 0.0), ("dollBody", 0.1, 0.1)]);
        let samples = [-10.0, -1.0, 0.0, 0.05, 0.1, 0.5, 1.0, 2.0, 50.0];
        for a in samples {
            for b in samples {
                let arch = [
                    archetype("x", &[("bigHips", a), ("pregnant", b), ("dollBody", a)]),
                    archetype("y", &[("bigHips", b), ("pregnant", a), ("dollBody", b)]),
                ];
                let env = build_envelope(&arch, &db);
                assert!(env.is_within(&db), "escaped bounds for ({}, {})", a, b);
                assert_eq!(env.shape_range("pregnant"), Some(BoundsRange::point(0.0)));
            }
        }
    }

    #[test]
    fn test_constrain_to_pulls_client_envelope_inside_bounds() {
        let db = bounds(&[("bigHips", 0.0, 1.0), ("pregnant", 0.0, 0.0), ("narrowWaist", 0.0, 0.5)]);
        let mut client = Envelope::default();
        client.shape_params.insert(
            "bigHips".to_string(),
            EnvelopeRange {
                min: -2.0,
                max: 0.7,
                archetype_min: Some(-2.0),
                archetype_max: Some(0.7),
                source: EnvelopeSource::Archetype,
            },
        );
        client.shape_params.insert(
            "pregnant".to_string(),
            EnvelopeRange {
                min: 0.5,
                max: 1.5,
                archetype_min: None,
                archetype_max: None,
                source: EnvelopeSource::Archetype,
            },
        );
        client.shape_params.insert(
            "tail".to_string(),
            EnvelopeRange {
                min: 0.0,
                max: 1.0,
                archetype_min: None,
                archetype_max: None,
                source: EnvelopeSource::Archetype,
            },
        );

        let env = client.constrain_to(&db);
        assert!(env.is_within(&db));
        assert_eq!(env.shape_range("bigHips"), Some(BoundsRange::new(0.0, 0.7)));
        assert_eq!(env.shape_range("pregnant"), Some(BoundsRange::point(0.0)));
        assert_eq!(env.shape_params["narrowWaist"].source, EnvelopeSource::DbFallback);
        assert!(!env.shape_params.contains_key("tail"));
    }

    #[test]
    fn test_from_bounds_is_all_fallback() {
        let db = bounds(&[("bigHips", 0.0, 1.0), ("pregnant", 0.0, 0.0)]);
        let env = Envelope::from_bounds(&db);
        assert_eq!(env.metadata.keys_with_archetype_data, 0);
        assert_eq!(env.metadata.keys_with_db_fallback, 1);
        assert!(env.metadata.archetypes_used.is_empty());
    }
}
