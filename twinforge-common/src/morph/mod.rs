//! Morph data model shared by the scan services
//!
//! Vectors are `BTreeMap`s so that every rendering of a vector (prompts,
//! persisted JSON, logs) lists keys in the same order.

pub mod vocabulary;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use vocabulary::{is_limb_key, is_shape_key, LIMB_KEYS, SHAPE_KEYS};

/// Shape parameter key → value
pub type MorphVector = BTreeMap<String, f64>;

/// Limb name → positive mass multiplier
pub type LimbMassVector = BTreeMap<String, f64>;

/// Gender used for reference-data lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Masculine,
    Feminine,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Masculine => "masculine",
            Gender::Feminine => "feminine",
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "masculine" | "male" | "m" | "homme" | "masculin" => Ok(Gender::Masculine),
            "feminine" | "female" | "f" | "femme" | "féminin" => Ok(Gender::Feminine),
            other => Err(Error::InvalidInput(format!("Unknown gender: {}", other))),
        }
    }
}

/// Inclusive numeric range for one key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsRange {
    pub min: f64,
    pub max: f64,
}

impl BoundsRange {
    /// Build a range, swapping the ends if given out of order
    pub fn new(a: f64, b: f64) -> Self {
        if a <= b {
            Self { min: a, max: b }
        } else {
            Self { min: b, max: a }
        }
    }

    pub fn point(value: f64) -> Self {
        Self { min: value, max: value }
    }

    /// `min == max == 0`: the key must stay at exactly 0
    pub fn is_banned(&self) -> bool {
        self.min == 0.0 && self.max == 0.0
    }

    /// `min == max != 0`: the key is pinned to that value
    pub fn is_fixed(&self) -> bool {
        self.min == self.max && !self.is_banned()
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Intersect with an outer range, staying inside `outer`
    ///
    /// Disjoint ranges collapse onto the nearest edge of `outer`.
    pub fn intersect_within(&self, outer: &BoundsRange) -> BoundsRange {
        if self.min > outer.max {
            return BoundsRange::point(outer.max);
        }
        if self.max < outer.min {
            return BoundsRange::point(outer.min);
        }
        BoundsRange {
            min: self.min.max(outer.min),
            max: self.max.min(outer.max),
        }
    }

    pub fn is_within(&self, outer: &BoundsRange) -> bool {
        self.min >= outer.min && self.max <= outer.max && self.min <= self.max
    }
}

/// Per-key physiological bounds for one gender
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysioBounds {
    pub shape_params: BTreeMap<String, BoundsRange>,
    pub limb_masses: BTreeMap<String, BoundsRange>,
}

impl PhysioBounds {
    pub fn banned_shape_keys(&self) -> Vec<&str> {
        self.shape_params
            .iter()
            .filter(|(_, r)| r.is_banned())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn fixed_shape_keys(&self) -> Vec<(&str, f64)> {
        self.shape_params
            .iter()
            .filter(|(_, r)| r.is_fixed())
            .map(|(k, r)| (k.as_str(), r.min))
            .collect()
    }
}

/// Reference girths stored with an archetype (centimetres)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeMeasurements {
    pub chest_cm: f64,
    pub waist_cm: f64,
    pub hips_cm: f64,
}

/// A reference body archetype row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archetype {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub obesity: String,
    pub muscularity: String,
    pub level: String,
    pub morphotype: String,
    pub bmi: Option<f64>,
    #[serde(default)]
    pub morph_values: MorphVector,
    #[serde(default)]
    pub limb_masses: LimbMassVector,
    pub measurements: Option<ArchetypeMeasurements>,
}

/// Keys removed while sanitizing a vector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizeReport {
    pub unknown_keys: Vec<String>,
    pub non_finite_keys: Vec<String>,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.unknown_keys.is_empty() && self.non_finite_keys.is_empty()
    }
}

/// Keep only canonical keys with finite values
pub fn sanitize_vector<F>(input: &BTreeMap<String, f64>, is_key: F) -> (BTreeMap<String, f64>, SanitizeReport)
where
    F: Fn(&str) -> bool,
{
    let mut report = SanitizeReport::default();
    let mut out = BTreeMap::new();

    for (key, value) in input {
        if !is_key(key) {
            report.unknown_keys.push(key.clone());
        } else if !value.is_finite() {
            report.non_finite_keys.push(key.clone());
        } else {
            out.insert(key.clone(), *value);
        }
    }

    (out, report)
}
