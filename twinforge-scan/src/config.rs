//! Configuration resolution for twinforge-scan
//!
//! Multi-tier resolution: database → environment → TOML → compiled default.

use crate::db::settings;
use sqlx::{Pool, Sqlite};
use std::time::Duration;
use tracing::{info, warn};
use twinforge_common::config::{Environment, TomlConfig};
use twinforge_common::{Error, Result};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 5740;

/// Default vision model
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Default OpenAI-compatible API root
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default upstream request timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default outbound request budget
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 30;

/// Environment variables checked for the API key, in order
pub const API_KEY_ENV_VARS: &[&str] = &["TWINFORGE_OPENAI_API_KEY", "OPENAI_API_KEY"];

/// Resolved vision model settings
#[derive(Debug, Clone, PartialEq)]
pub struct VisionSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub requests_per_minute: u32,
}

/// Resolved service settings shared by the handlers
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub environment: Environment,
    /// User id whose commits skip the database outside production
    pub mock_user_id: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            mock_user_id: None,
        }
    }
}

impl ServiceSettings {
    /// True when requests for `user_id` should bypass the database
    pub fn is_mock_user(&self, user_id: &str) -> bool {
        !self.environment.is_production()
            && self.mock_user_id.as_deref().is_some_and(|mock| mock == user_id)
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve the vision model API key from 3-tier configuration
///
/// **Priority:** Database → ENV → TOML
pub fn resolve_openai_api_key(db_key: Option<&str>, toml_config: &TomlConfig) -> Result<String> {
    let mut sources = Vec::new();

    let db_key = db_key.filter(|k| is_valid_key(k)).map(str::to_string);
    if db_key.is_some() {
        sources.push("database");
    }

    let env_key = API_KEY_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| is_valid_key(k));
    if env_key.is_some() {
        sources.push("environment");
    }

    let toml_key = toml_config.openai.api_key.clone().filter(|k| is_valid_key(k));
    if toml_key.is_some() {
        sources.push("TOML");
    }

    if sources.len() > 1 {
        warn!(
            "Vision API key found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(key) = db_key {
        info!("Vision API key loaded from database");
        return Ok(key);
    }
    if let Some(key) = env_key {
        info!("Vision API key loaded from environment variable");
        return Ok(key);
    }
    if let Some(key) = toml_key {
        info!("Vision API key loaded from TOML config");
        return Ok(key);
    }

    Err(Error::Config(
        "Vision API key not configured. Please configure using one of:\n\
         1. Database: settings key 'openai_api_key'\n\
         2. Environment: TWINFORGE_OPENAI_API_KEY=your-key-here\n\
         3. TOML config: ~/.config/twinforge/config.toml ([openai] api_key = \"your-key\")"
            .to_string(),
    ))
}

/// Resolve everything the vision client needs
///
/// Database overrides win over the TOML file. A missing key is not fatal: the
/// service starts and the AI endpoints report the configuration error per
/// request.
pub async fn resolve_vision_settings(db: &Pool<Sqlite>, toml_config: &TomlConfig) -> Result<VisionSettings> {
    let overrides = settings::load_vision_overrides(db).await?;

    let api_key = match resolve_openai_api_key(overrides.api_key.as_deref(), toml_config) {
        Ok(key) => Some(key),
        Err(Error::Config(msg)) => {
            warn!("{}", msg);
            None
        }
        Err(e) => return Err(e),
    };

    let model = overrides
        .model
        .or_else(|| toml_config.openai.model.clone())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let timeout_secs = overrides
        .timeout_secs
        .or(toml_config.openai.timeout_secs)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    Ok(VisionSettings {
        api_key,
        model,
        base_url: toml_config
            .openai
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
        timeout: Duration::from_secs(timeout_secs),
        requests_per_minute: overrides
            .requests_per_minute
            .or(toml_config.openai.requests_per_minute)
            .filter(|r| *r > 0)
            .unwrap_or(DEFAULT_REQUESTS_PER_MINUTE),
    })
}

/// Resolve service settings
///
/// **Priority:** CLI → ENV (`TWINFORGE_ENV`, `TWINFORGE_MOCK_USER_ID`) → TOML → default
pub fn resolve_service_settings(cli_environment: Option<Environment>, toml_config: &TomlConfig) -> ServiceSettings {
    let environment = cli_environment
        .or_else(|| {
            std::env::var("TWINFORGE_ENV").ok().and_then(|v| match v.parse() {
                Ok(env) => Some(env),
                Err(e) => {
                    warn!("Ignoring TWINFORGE_ENV: {}", e);
                    None
                }
            })
        })
        .or(toml_config.environment)
        .unwrap_or_default();

    let mock_user_id = std::env::var("TWINFORGE_MOCK_USER_ID")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| toml_config.mock_user_id.clone());

    ServiceSettings {
        environment,
        mock_user_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::settings::SettingKey;
    use serial_test::serial;
    use twinforge_common::config::OpenAiConfig;
    use twinforge_common::db::open_in_memory;

    fn clear_env() {
        for name in API_KEY_ENV_VARS {
            std::env::remove_var(name);
        }
        std::env::remove_var("TWINFORGE_ENV");
        std::env::remove_var("TWINFORGE_MOCK_USER_ID");
    }

    fn toml_with_key(key: Option<&str>) -> TomlConfig {
        TomlConfig {
            openai: OpenAiConfig {
                api_key: key.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_database_key_wins() {
        clear_env();
        let pool = open_in_memory().await.unwrap();
        settings::store_setting(&pool, SettingKey::OpenAiApiKey, "db-key").await.unwrap();
        std::env::set_var("TWINFORGE_OPENAI_API_KEY", "env-key");

        let vision = resolve_vision_settings(&pool, &toml_with_key(Some("toml-key"))).await.unwrap();
        assert_eq!(vision.api_key.as_deref(), Some("db-key"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_then_toml() {
        clear_env();
        std::env::set_var("OPENAI_API_KEY", "env-key");
        let key = resolve_openai_api_key(None, &toml_with_key(Some("toml-key"))).unwrap();
        assert_eq!(key, "env-key");

        clear_env();
        let key = resolve_openai_api_key(Some("  "), &toml_with_key(Some("toml-key"))).unwrap();
        assert_eq!(key, "toml-key");
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_or_blank_key_is_config_error() {
        clear_env();
        let err = resolve_openai_api_key(None, &toml_with_key(Some("   "))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let pool = open_in_memory().await.unwrap();
        let vision = resolve_vision_settings(&pool, &toml_with_key(None)).await.unwrap();
        assert_eq!(vision.api_key, None);
        assert_eq!(vision.model, DEFAULT_MODEL);
        assert_eq!(vision.requests_per_minute, DEFAULT_REQUESTS_PER_MINUTE);
        assert_eq!(vision.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[tokio::test]
    #[serial]
    async fn test_database_overrides_beat_toml() {
        clear_env();
        let pool = open_in_memory().await.unwrap();
        settings::store_setting(&pool, SettingKey::OpenAiModel, "gpt-4o-mini").await.unwrap();
        settings::store_setting(&pool, SettingKey::RequestsPerMinute, "5").await.unwrap();
        let toml = TomlConfig {
            openai: OpenAiConfig {
                model: Some("toml-model".to_string()),
                timeout_secs: Some(20),
                requests_per_minute: Some(50),
                ..Default::default()
            },
            ..Default::default()
        };

        let vision = resolve_vision_settings(&pool, &toml).await.unwrap();
        assert_eq!(vision.model, "gpt-4o-mini");
        assert_eq!(vision.requests_per_minute, 5);
        assert_eq!(vision.timeout, Duration::from_secs(20));
    }

    #[test]
    #[serial]
    fn test_mock_user_only_outside_production() {
        clear_env();
        let toml = TomlConfig {
            mock_user_id: Some("mock-user".to_string()),
            ..Default::default()
        };

        let dev = resolve_service_settings(None, &toml);
        assert!(dev.is_mock_user("mock-user"));
        assert!(!dev.is_mock_user("someone"));

        let prod = resolve_service_settings(Some(Environment::Production), &toml);
        assert!(!prod.is_mock_user("mock-user"));

        std::env::set_var("TWINFORGE_ENV", "production");
        assert!(!resolve_service_settings(None, &toml).is_mock_user("mock-user"));
        clear_env();
    }
}
