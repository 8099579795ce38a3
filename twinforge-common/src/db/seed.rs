//! Reference archetype seed data

use crate::morph::Archetype;
use crate::{Error, Result};
use sqlx::SqlitePool;

const SEED_ARCHETYPES: &str = include_str!("../../seeds/archetypes.json");

/// Parse the embedded archetype seed file
pub fn bundled_archetypes() -> Result<Vec<Archetype>> {
    serde_json::from_str(SEED_ARCHETYPES)
        .map_err(|e| Error::Config(format!("Bundled archetype seed is invalid: {}", e)))
}

/// Insert the bundled archetypes when the table is empty
///
/// Returns the number of rows inserted (0 when reference data already exists).
pub async fn seed_reference_archetypes(pool: &SqlitePool) -> Result<usize> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM morph_archetypes")
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(0);
    }

    let archetypes = bundled_archetypes()?;
    let mut tx = pool.begin().await?;
    for archetype in &archetypes {
        insert_archetype(&mut *tx, archetype).await?;
    }
    tx.commit().await?;

    Ok(archetypes.len())
}

/// Insert one archetype row
pub async fn insert_archetype<'e, E>(executor: E, archetype: &Archetype) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let measurements = archetype
        .measurements
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO morph_archetypes
            (id, name, gender, obesity, muscularity, level, morphotype, bmi, morph_values, limb_masses, measurements)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&archetype.id)
    .bind(&archetype.name)
    .bind(archetype.gender.as_str())
    .bind(&archetype.obesity)
    .bind(&archetype.muscularity)
    .bind(&archetype.level)
    .bind(&archetype.morphotype)
    .bind(archetype.bmi)
    .bind(serde_json::to_string(&archetype.morph_values)?)
    .bind(serde_json::to_string(&archetype.limb_masses)?)
    .bind(measurements)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::{is_limb_key, is_shape_key, Gender};

    #[test]
    fn test_bundled_archetypes_parse_and_use_canonical_keys() {
        let archetypes = bundled_archetypes().unwrap();
        assert!(archetypes.iter().any(|a| a.gender == Gender::Masculine));
        assert!(archetypes.iter().any(|a| a.gender == Gender::Feminine));

        for a in &archetypes {
            assert!(a.morph_values.keys().all(|k| is_shape_key(k)), "{} has unknown shape key", a.id);
            assert!(a.limb_masses.keys().all(|k| is_limb_key(k)), "{} has unknown limb key", a.id);
        }
    }

    #[test]
    fn test_masculine_seed_has_no_pregnancy_values() {
        let archetypes = bundled_archetypes().unwrap();
        assert!(archetypes
            .iter()
            .filter(|a| a.gender == Gender::Masculine)
            .all(|a| !a.morph_values.contains_key("pregnant")));
    }
}
