//! Body scan records
//!
//! A scan row is written once at commit and never updated.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use twinforge_common::morph::{LimbMassVector, MorphVector};
use twinforge_common::{Error, Gender, Result};
use uuid::Uuid;

/// Persisted scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: Uuid,
    pub user_id: String,
    pub resolved_gender: Gender,
    pub declared_height_cm: Option<f64>,
    pub declared_weight_kg: Option<f64>,
    pub estimated_bmi: Option<f64>,
    pub raw_measurements: Option<Value>,
    pub semantic_profile: Option<Value>,
    pub envelope: Option<Value>,
    pub final_shape_params: MorphVector,
    pub final_limb_masses: LimbMassVector,
    pub skin_tone: Option<Value>,
    pub model_id: Option<String>,
    pub vocabulary_version: String,
    pub created_at: DateTime<Utc>,
}

fn json_text(value: &Option<Value>) -> Result<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Error::from)
}

/// Insert a scan
///
/// A duplicate id is a [`Error::Conflict`]; existing rows are never replaced.
pub async fn insert_scan(pool: &SqlitePool, scan: &ScanRecord) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO body_scans
            (id, user_id, resolved_gender, declared_height_cm, declared_weight_kg, estimated_bmi,
             raw_measurements, semantic_profile, envelope, final_shape_params, final_limb_masses,
             skin_tone, model_id, vocabulary_version, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(scan.id.to_string())
    .bind(&scan.user_id)
    .bind(scan.resolved_gender.as_str())
    .bind(scan.declared_height_cm)
    .bind(scan.declared_weight_kg)
    .bind(scan.estimated_bmi)
    .bind(json_text(&scan.raw_measurements)?)
    .bind(json_text(&scan.semantic_profile)?)
    .bind(json_text(&scan.envelope)?)
    .bind(serde_json::to_string(&scan.final_shape_params)?)
    .bind(serde_json::to_string(&scan.final_limb_masses)?)
    .bind(json_text(&scan.skin_tone)?)
    .bind(&scan.model_id)
    .bind(&scan.vocabulary_version)
    .bind(scan.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
    .execute(pool)
    .await;

    match result {
        Ok(_) => {
            info!(scan_id = %scan.id, user_id = %scan.user_id, "Body scan stored");
            Ok(())
        }
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(Error::Conflict(format!("Scan {} already exists", scan.id)))
        }
        Err(e) => Err(Error::Database(e)),
    }
}

/// Most recent scan of a user
pub async fn latest_scan_for_user(pool: &SqlitePool, user_id: &str) -> Result<Option<ScanRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, resolved_gender, declared_height_cm, declared_weight_kg, estimated_bmi,
               raw_measurements, semantic_profile, envelope, final_shape_params, final_limb_masses,
               skin_tone, model_id, vocabulary_version, created_at
        FROM body_scans
        WHERE user_id = ?
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_scan).transpose()
}

fn row_to_scan(row: &SqliteRow) -> Result<ScanRecord> {
    let parse_json = |column: &str| -> Result<Option<Value>> {
        let text: Option<String> = row.try_get(column)?;
        text.map(|t| serde_json::from_str(&t)).transpose().map_err(Error::from)
    };

    let id: String = row.try_get("id")?;
    let gender: String = row.try_get("resolved_gender")?;
    let shape: String = row.try_get("final_shape_params")?;
    let limbs: String = row.try_get("final_limb_masses")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ScanRecord {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Invalid scan id {}: {}", id, e)))?,
        user_id: row.try_get("user_id")?,
        resolved_gender: gender
            .parse::<Gender>()
            .map_err(|e| Error::Internal(format!("Scan {} has invalid gender: {}", id, e)))?,
        declared_height_cm: row.try_get("declared_height_cm")?,
        declared_weight_kg: row.try_get("declared_weight_kg")?,
        estimated_bmi: row.try_get("estimated_bmi")?,
        raw_measurements: parse_json("raw_measurements")?,
        semantic_profile: parse_json("semantic_profile")?,
        envelope: parse_json("envelope")?,
        final_shape_params: serde_json::from_str(&shape)?,
        final_limb_masses: serde_json::from_str(&limbs)?,
        skin_tone: parse_json("skin_tone")?,
        model_id: row.try_get("model_id")?,
        vocabulary_version: row.try_get("vocabulary_version")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Internal(format!("Invalid scan timestamp {}: {}", created_at, e)))?
            .with_timezone(&Utc),
    })
}
