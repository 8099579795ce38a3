//! Canonical morph vocabulary
//!
//! Shape keys and limb keys accepted anywhere in the pipeline. Vectors coming
//! from clients or from the vision model are filtered against these lists
//! before any range arithmetic happens.

/// Version tag persisted with every scan so stored vectors can be migrated
pub const MORPH_VOCABULARY_VERSION: &str = "tf-morph-v3";

/// Canonical shape parameter keys, sorted
pub const SHAPE_KEYS: &[&str] = &[
    "animeWaist",
    "assLarge",
    "bellyFat",
    "bigHips",
    "bodybuilderDetails",
    "bodybuilderSize",
    "breastsSag",
    "breastsSmall",
    "dollBody",
    "emaciated",
    "lowerBodyFat",
    "muscleMass",
    "narrowWaist",
    "pearFigure",
    "powerlifterSize",
    "pregnant",
    "shoulderWidth",
    "superBreast",
    "upperBodyFat",
];

/// Canonical limb mass keys, sorted
pub const LIMB_KEYS: &[&str] = &[
    "armMass",
    "calfMass",
    "forearmMass",
    "headMass",
    "legMass",
    "neckMass",
    "thighMass",
    "torsoMass",
];

/// Shape keys restricted by muscularity gating
pub const MUSCULAR_KEYS: &[&str] = &[
    "bodybuilderDetails",
    "bodybuilderSize",
    "muscleMass",
    "powerlifterSize",
];

/// Shape keys driven by adiposity
pub const ADIPOSITY_KEYS: &[&str] = &["bellyFat", "lowerBodyFat", "upperBodyFat"];

/// Shape keys biased by a wide hip-to-shoulder ratio
pub const HIP_KEYS: &[&str] = &["assLarge", "bigHips", "pearFigure"];

/// Shape keys biased by a narrow waist-to-hip ratio
pub const WAIST_KEYS: &[&str] = &["animeWaist", "narrowWaist"];

/// Neutral limb multiplier
pub const LIMB_MASS_DEFAULT: f64 = 1.0;

/// Raw semantic extraction range for shape keys
pub const RAW_SHAPE_MIN: f64 = -3.0;
pub const RAW_SHAPE_MAX: f64 = 3.0;

pub fn is_shape_key(key: &str) -> bool {
    SHAPE_KEYS.binary_search(&key).is_ok()
}

pub fn is_limb_key(key: &str) -> bool {
    LIMB_KEYS.binary_search(&key).is_ok()
}

/// Semantic labels as stored in the archetype table
pub mod labels {
    pub const OBESITY_NON_OBESE: &str = "Non obèse";
    pub const OBESITY_OVERWEIGHT: &str = "Surpoids";
    pub const OBESITY_OBESE: &str = "Obèse";

    pub const LEVEL_THIN: &str = "Mince";
    pub const LEVEL_NORMAL: &str = "Normal";
    pub const LEVEL_OVERWEIGHT: &str = "Surpoids";
    pub const LEVEL_OBESE: &str = "Obèse";

    /// Muscularity labels ordered weakest to strongest
    pub const MUSCULARITY_ORDER: &[&str] = &[
        "Atrophié",
        "Normal",
        "Moyen musclé",
        "Musclé",
        "Très musclé",
    ];

    pub const DEFAULT_OBESITY: &[&str] = &[OBESITY_NON_OBESE, OBESITY_OVERWEIGHT, OBESITY_OBESE];
    pub const DEFAULT_LEVEL: &[&str] = &[LEVEL_THIN, LEVEL_NORMAL, LEVEL_OVERWEIGHT, LEVEL_OBESE];
    pub const DEFAULT_MORPHOTYPE: &[&str] = &["DIAM", "POI", "REC", "ROND", "SAB", "TRI"];

    /// Position of a muscularity label in the strength order
    ///
    /// Labels unknown to this build rank between "Normal" and "Moyen musclé"
    /// so reference-data additions never sort below the atrophied tier.
    pub fn muscularity_rank(label: &str) -> f64 {
        MUSCULARITY_ORDER
            .iter()
            .position(|l| *l == label)
            .map(|p| p as f64)
            .unwrap_or(1.5)
    }
}
