//! Physiological bounds lookup
//!
//! Bounds are derived from the archetype table itself: for each canonical key
//! the admissible range is the span of values stored across every archetype of
//! the gender. A shape key no archetype of that gender ever uses is banned
//! (`{0, 0}`); a limb key no archetype uses is pinned at the neutral
//! multiplier.

use async_trait::async_trait;
use std::collections::BTreeMap;
use twinforge_common::morph::vocabulary::LIMB_MASS_DEFAULT;
use twinforge_common::morph::{Archetype, PhysioBounds, LIMB_KEYS, SHAPE_KEYS};
use twinforge_common::{BoundsRange, Gender};

/// Source of per-gender physiological bounds
#[async_trait]
pub trait BoundsSource: Send + Sync {
    async fn bounds_for(&self, gender: Gender) -> twinforge_common::Result<PhysioBounds>;
}

/// Compute bounds over all archetypes of one gender
///
/// Archetypes of other genders in `archetypes` are ignored.
pub fn compute_bounds(archetypes: &[Archetype], gender: Gender) -> PhysioBounds {
    let rows: Vec<&Archetype> = archetypes.iter().filter(|a| a.gender == gender).collect();

    let shape_params = span_per_key(SHAPE_KEYS, &rows, |a| &a.morph_values, BoundsRange::point(0.0));
    let limb_masses = span_per_key(
        LIMB_KEYS,
        &rows,
        |a| &a.limb_masses,
        BoundsRange::point(LIMB_MASS_DEFAULT),
    );

    PhysioBounds {
        shape_params,
        limb_masses,
    }
}

fn span_per_key<F>(
    keys: &[&str],
    rows: &[&Archetype],
    select: F,
    unobserved: BoundsRange,
) -> BTreeMap<String, BoundsRange>
where
    F: Fn(&Archetype) -> &BTreeMap<String, f64>,
{
    keys.iter()
        .map(|key| {
            let range = extrema(rows.iter().filter_map(|a| select(a).get(*key).copied()))
                .unwrap_or(unobserved);
            (key.to_string(), range)
        })
        .collect()
}

/// Min/max over finite values, `None` when there are none
pub fn extrema<I>(values: I) -> Option<BoundsRange>
where
    I: IntoIterator<Item = f64>,
{
    values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<BoundsRange>, v| match acc {
            None => Some(BoundsRange::point(v)),
            Some(r) => Some(BoundsRange {
                min: r.min.min(v),
                max: r.max.max(v),
            }),
        })
}
