//! Vision overrides stored in the `settings` table
//!
//! Operators can change the model, key and request budget without touching
//! the config file. All overrides are read together at startup.

use sqlx::SqlitePool;
use std::fmt::Display;
use std::str::FromStr;
use twinforge_common::{Error, Result};

/// Settings keys read by the scan service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    OpenAiApiKey,
    OpenAiModel,
    RequestsPerMinute,
    TimeoutSecs,
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        SettingKey::OpenAiApiKey,
        SettingKey::OpenAiModel,
        SettingKey::RequestsPerMinute,
        SettingKey::TimeoutSecs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::OpenAiApiKey => "openai_api_key",
            SettingKey::OpenAiModel => "openai_model",
            SettingKey::RequestsPerMinute => "vision_requests_per_minute",
            SettingKey::TimeoutSecs => "vision_timeout_secs",
        }
    }

    fn from_column(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

/// Values found in the database; blank rows count as unset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisionOverrides {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub requests_per_minute: Option<u32>,
    pub timeout_secs: Option<u64>,
}

fn parse_number<T>(key: SettingKey, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("Setting {} = '{}' is not a valid number: {}", key.as_str(), value, e)))
}

/// Read every vision override in one query
pub async fn load_vision_overrides(db: &SqlitePool) -> Result<VisionOverrides> {
    let mut query = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings WHERE key IN (?, ?, ?, ?)");
    for key in SettingKey::ALL {
        query = query.bind(key.as_str());
    }
    let rows = query.fetch_all(db).await?;

    let mut overrides = VisionOverrides::default();
    for (column, value) in rows {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match SettingKey::from_column(&column) {
            Some(SettingKey::OpenAiApiKey) => overrides.api_key = Some(value.to_string()),
            Some(SettingKey::OpenAiModel) => overrides.model = Some(value.to_string()),
            Some(key @ SettingKey::RequestsPerMinute) => overrides.requests_per_minute = Some(parse_number(key, value)?),
            Some(key @ SettingKey::TimeoutSecs) => overrides.timeout_secs = Some(parse_number(key, value)?),
            None => {}
        }
    }
    Ok(overrides)
}

/// Insert or replace one override
pub async fn store_setting(db: &SqlitePool, key: SettingKey, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key.as_str())
    .bind(value)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinforge_common::db::open_in_memory;

    #[tokio::test]
    async fn test_empty_table_has_no_overrides() {
        let pool = open_in_memory().await.unwrap();
        assert_eq!(load_vision_overrides(&pool).await.unwrap(), VisionOverrides::default());
    }

    #[tokio::test]
    async fn test_overrides_read_together_and_replaced() {
        let pool = open_in_memory().await.unwrap();
        store_setting(&pool, SettingKey::OpenAiApiKey, "old-key").await.unwrap();
        store_setting(&pool, SettingKey::OpenAiApiKey, "new-key").await.unwrap();
        store_setting(&pool, SettingKey::OpenAiModel, "  ").await.unwrap();
        store_setting(&pool, SettingKey::RequestsPerMinute, "12").await.unwrap();
        sqlx::query("INSERT INTO settings (key, value) VALUES ('ui_theme', 'dark')")
            .execute(&pool)
            .await
            .unwrap();

        let overrides = load_vision_overrides(&pool).await.unwrap();
        assert_eq!(overrides.api_key.as_deref(), Some("new-key"));
        assert_eq!(overrides.model, None);
        assert_eq!(overrides.requests_per_minute, Some(12));
        assert_eq!(overrides.timeout_secs, None);
    }

    #[tokio::test]
    async fn test_bad_number_names_the_setting() {
        let pool = open_in_memory().await.unwrap();
        store_setting(&pool, SettingKey::TimeoutSecs, "soon").await.unwrap();

        match load_vision_overrides(&pool).await {
            Err(Error::Config(msg)) => assert!(msg.contains("vision_timeout_secs"), "{}", msg),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
