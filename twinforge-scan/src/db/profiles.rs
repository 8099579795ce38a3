//! User profile access
//!
//! The profile row carries body basics and a free-form `preferences` JSON
//! object. Scan commits merge the latest avatar fields into `preferences`
//! key by key; other keys are left alone.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use twinforge_common::{Gender, Result};

/// Stored user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub gender: Option<Gender>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub preferences: Map<String, Value>,
    pub updated_at: String,
}

/// Load a user's profile
pub async fn get_profile(pool: &SqlitePool, user_id: &str) -> Result<Option<UserProfile>> {
    let row = sqlx::query(
        "SELECT user_id, gender, height_cm, weight_kg, preferences, updated_at
         FROM user_profile WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let gender: Option<String> = row.try_get("gender")?;
    let gender = gender.and_then(|g| match g.parse::<Gender>() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(user_id, error = %e, "Ignoring unrecognized profile gender");
            None
        }
    });

    let preferences: String = row.try_get("preferences")?;
    let preferences = match serde_json::from_str::<Value>(&preferences) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(user_id, "Profile preferences are not a JSON object, treating as empty");
            Map::new()
        }
    };

    Ok(Some(UserProfile {
        user_id: row.try_get("user_id")?,
        gender,
        height_cm: row.try_get("height_cm")?,
        weight_kg: row.try_get("weight_kg")?,
        preferences,
        updated_at: row.try_get("updated_at")?,
    }))
}

/// Create or update body basics without touching preferences
pub async fn upsert_profile_body(
    pool: &SqlitePool,
    user_id: &str,
    gender: Option<Gender>,
    height_cm: Option<f64>,
    weight_kg: Option<f64>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_profile (user_id, gender, height_cm, weight_kg, preferences, updated_at)
        VALUES (?, ?, ?, ?, '{}', ?)
        ON CONFLICT(user_id) DO UPDATE SET
            gender = COALESCE(excluded.gender, user_profile.gender),
            height_cm = COALESCE(excluded.height_cm, user_profile.height_cm),
            weight_kg = COALESCE(excluded.weight_kg, user_profile.weight_kg),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(gender.map(Gender::as_str))
    .bind(height_cm)
    .bind(weight_kg)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Shallow merge: top-level keys of `update` replace those of `existing`
pub fn merge_preferences(existing: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        existing.insert(key.clone(), value.clone());
    }
}

/// Merge avatar fields into the user's preferences and store the result
///
/// Read, merge and write are separate statements; two concurrent commits for
/// one user can lose each other's non-overlapping keys. The row write itself
/// is a single atomic upsert.
pub async fn upsert_profile_preferences(
    pool: &SqlitePool,
    user_id: &str,
    update: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut preferences = get_profile(pool, user_id)
        .await?
        .map(|p| p.preferences)
        .unwrap_or_default();
    merge_preferences(&mut preferences, update);

    sqlx::query(
        r#"
        INSERT INTO user_profile (user_id, preferences, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            preferences = excluded.preferences,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(serde_json::to_string(&preferences)?)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    debug!(user_id, keys = update.len(), "Profile preferences merged");
    Ok(preferences)
}

/// Stored preferences blob, as loaded
pub async fn get_preferences(pool: &SqlitePool, user_id: &str) -> Result<Map<String, Value>> {
    let row = sqlx::query("SELECT preferences FROM user_profile WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(Map::new());
    };
    let text: String = row.try_get("preferences")?;
    Ok(serde_json::from_str(&text).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use twinforge_common::db::open_in_memory;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_merge_is_shallow() {
        let mut existing = object(json!({"theme": "dark", "avatar": {"skin": "a", "hair": "b"}}));
        merge_preferences(&mut existing, &object(json!({"avatar": {"skin": "c"}})));
        assert_eq!(existing["theme"], json!("dark"));
        assert_eq!(existing["avatar"], json!({"skin": "c"}));
    }

    #[tokio::test]
    async fn test_upsert_preserves_unrelated_keys() {
        let pool = open_in_memory().await.unwrap();
        upsert_profile_preferences(&pool, "u1", &object(json!({"theme": "dark", "last_scan_id": "a"})))
            .await
            .unwrap();
        let merged = upsert_profile_preferences(&pool, "u1", &object(json!({"last_scan_id": "b"})))
            .await
            .unwrap();

        assert_eq!(merged["theme"], json!("dark"));
        assert_eq!(merged["last_scan_id"], json!("b"));
        assert_eq!(get_preferences(&pool, "u1").await.unwrap(), merged);
    }

    #[tokio::test]
    async fn test_body_upsert_keeps_preferences_and_known_fields() {
        let pool = open_in_memory().await.unwrap();
        upsert_profile_preferences(&pool, "u2", &object(json!({"theme": "light"})))
            .await
            .unwrap();
        upsert_profile_body(&pool, "u2", Some(Gender::Feminine), Some(168.0), None)
            .await
            .unwrap();
        upsert_profile_body(&pool, "u2", None, None, Some(61.0)).await.unwrap();

        let profile = get_profile(&pool, "u2").await.unwrap().unwrap();
        assert_eq!(profile.gender, Some(Gender::Feminine));
        assert_eq!(profile.height_cm, Some(168.0));
        assert_eq!(profile.weight_kg, Some(61.0));
        assert_eq!(profile.preferences["theme"], json!("light"));
    }

    #[tokio::test]
    async fn test_missing_profile() {
        let pool = open_in_memory().await.unwrap();
        assert!(get_profile(&pool, "ghost").await.unwrap().is_none());
        assert!(get_preferences(&pool, "ghost").await.unwrap().is_empty());
    }
}
