//! Reference archetype queries
//!
//! [`ArchetypeRepository`] is the live reference-data source: it backs both
//! the semantic vocabulary and the physiological bounds, so whatever rows the
//! table holds right now define what is valid.

use crate::pipeline::bounds::{compute_bounds, BoundsSource};
use crate::pipeline::semantic::{SemanticVocabulary, VocabularySource};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use twinforge_common::morph::{Archetype, ArchetypeMeasurements, PhysioBounds};
use twinforge_common::{Error, Gender, Result};

const SELECT_ARCHETYPE: &str = "SELECT id, name, gender, obesity, muscularity, level, morphotype, \
     bmi, morph_values, limb_masses, measurements FROM morph_archetypes";

/// Categorical columns that make up the semantic vocabulary
#[derive(Debug, Clone, Copy)]
enum LabelColumn {
    Obesity,
    Muscularity,
    Level,
    Morphotype,
}

impl LabelColumn {
    fn name(self) -> &'static str {
        match self {
            LabelColumn::Obesity => "obesity",
            LabelColumn::Muscularity => "muscularity",
            LabelColumn::Level => "level",
            LabelColumn::Morphotype => "morphotype",
        }
    }
}

/// Archetype table access
#[derive(Debug, Clone)]
pub struct ArchetypeRepository {
    pool: SqlitePool,
}

impl ArchetypeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All archetypes of a gender, ordered by id
    pub async fn load_for_gender(&self, gender: Gender) -> Result<Vec<Archetype>> {
        let rows = sqlx::query(&format!("{} WHERE gender = ? ORDER BY id", SELECT_ARCHETYPE))
            .bind(gender.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_archetype).collect()
    }

    /// Archetypes with the given ids, in the order requested
    ///
    /// Unknown ids are skipped.
    pub async fn load_by_ids(&self, ids: &[String]) -> Result<Vec<Archetype>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ARCHETYPE))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => out.push(row_to_archetype(&row)?),
                None => debug!(id = %id, "Requested archetype not found"),
            }
        }
        Ok(out)
    }

    /// Archetype of the gender whose BMI is closest to `bmi`
    pub async fn nearest_by_bmi(&self, gender: Gender, bmi: f64) -> Result<Option<Archetype>> {
        let row = sqlx::query(&format!(
            "{} WHERE gender = ? AND bmi IS NOT NULL ORDER BY ABS(bmi - ?), id LIMIT 1",
            SELECT_ARCHETYPE
        ))
        .bind(gender.as_str())
        .bind(bmi)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_archetype).transpose()
    }

    async fn distinct_labels(&self, gender: Gender, column: LabelColumn) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {0} FROM morph_archetypes WHERE gender = ? AND {0} <> '' ORDER BY {0}",
            column.name()
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(gender.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }
}

#[async_trait]
impl VocabularySource for ArchetypeRepository {
    async fn valid_values_for(&self, gender: Gender) -> Result<SemanticVocabulary> {
        Ok(SemanticVocabulary {
            obesity: self.distinct_labels(gender, LabelColumn::Obesity).await?,
            muscularity: self.distinct_labels(gender, LabelColumn::Muscularity).await?,
            level: self.distinct_labels(gender, LabelColumn::Level).await?,
            morphotype: self.distinct_labels(gender, LabelColumn::Morphotype).await?,
        })
    }
}

#[async_trait]
impl BoundsSource for ArchetypeRepository {
    async fn bounds_for(&self, gender: Gender) -> Result<PhysioBounds> {
        let rows = self.load_for_gender(gender).await?;
        debug!(%gender, archetypes = rows.len(), "Computing physiological bounds");
        Ok(compute_bounds(&rows, gender))
    }
}

fn row_to_archetype(row: &SqliteRow) -> Result<Archetype> {
    let gender: String = row.try_get("gender")?;
    let morph_values: String = row.try_get("morph_values")?;
    let limb_masses: String = row.try_get("limb_masses")?;
    let measurements: Option<String> = row.try_get("measurements")?;
    let id: String = row.try_get("id")?;

    let measurements = measurements
        .map(|m| serde_json::from_str::<ArchetypeMeasurements>(&m))
        .transpose()
        .map_err(|e| Error::Internal(format!("Archetype {} has invalid measurements: {}", id, e)))?;

    Ok(Archetype {
        name: row.try_get("name")?,
        gender: gender
            .parse::<Gender>()
            .map_err(|e| Error::Internal(format!("Archetype {} has invalid gender: {}", id, e)))?,
        obesity: row.try_get("obesity")?,
        muscularity: row.try_get("muscularity")?,
        level: row.try_get("level")?,
        morphotype: row.try_get("morphotype")?,
        bmi: row.try_get("bmi")?,
        morph_values: serde_json::from_str(&morph_values)?,
        limb_masses: serde_json::from_str(&limb_masses)?,
        measurements,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinforge_common::db::{bundled_archetypes, open_in_memory};
    use twinforge_common::BoundsRange;

    async fn repository() -> ArchetypeRepository {
        ArchetypeRepository::new(open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_rows_round_trip_seed_data() {
        let repo = repository().await;
        let stored = repo.load_for_gender(Gender::Feminine).await.unwrap();
        let mut seed: Vec<_> = bundled_archetypes()
            .unwrap()
            .into_iter()
            .filter(|a| a.gender == Gender::Feminine)
            .collect();
        seed.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(stored, seed);
    }

    #[tokio::test]
    async fn test_vocabulary_reflects_table_contents() {
        let repo = repository().await;
        let vocab = repo.valid_values_for(Gender::Masculine).await.unwrap();
        assert!(vocab.obesity.contains(&"Obèse".to_string()));
        assert!(vocab.morphotype.contains(&"TRI".to_string()));
        assert!(!vocab.morphotype.contains(&"SAB".to_string()));

        // A new label appears as soon as a row carries it
        let mut extra = bundled_archetypes().unwrap()[0].clone();
        extra.id = "M-DIAM-01".to_string();
        extra.morphotype = "DIAM".to_string();
        twinforge_common::db::insert_archetype(&repo.pool, &extra).await.unwrap();

        let vocab = repo.valid_values_for(Gender::Masculine).await.unwrap();
        assert!(vocab.morphotype.contains(&"DIAM".to_string()));
    }

    #[tokio::test]
    async fn test_bounds_from_database() {
        let repo = repository().await;
        let bounds = repo.bounds_for(Gender::Masculine).await.unwrap();
        assert_eq!(bounds.shape_params["pregnant"], BoundsRange::point(0.0));
        assert_eq!(bounds, compute_bounds(&bundled_archetypes().unwrap(), Gender::Masculine));
    }

    #[tokio::test]
    async fn test_nearest_by_bmi_and_lookup_by_ids() {
        let repo = repository().await;
        let nearest = repo.nearest_by_bmi(Gender::Masculine, 33.0).await.unwrap().unwrap();
        assert_eq!(nearest.id, "M-ROND-02");

        let ids = vec!["M-TRI-01".to_string(), "missing".to_string(), "M-REC-01".to_string()];
        let found = repo.load_by_ids(&ids).await.unwrap();
        let found_ids: Vec<_> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(found_ids, vec!["M-TRI-01", "M-REC-01"]);
    }
}
