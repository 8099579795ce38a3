//! Vision model client
//!
//! All three AI stages send a prompt plus photo URLs to an OpenAI-compatible
//! chat completions endpoint and get back the reply text. Failures are
//! classified so handlers can show the user a specific French message.

use crate::config::VisionSettings;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One captured photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoInput {
    /// Capture angle, e.g. "front" or "profile"
    pub view: String,
    pub url: String,
    /// Client-side capture report (lighting, framing), passed through as-is
    #[serde(default)]
    pub report: Option<Value>,
}

/// A single model call
#[derive(Debug, Clone, PartialEq)]
pub struct VisionRequest {
    pub system: String,
    pub prompt: String,
    pub photos: Vec<PhotoInput>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl VisionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, photos: Vec<PhotoInput>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            photos,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

/// Failure category of an upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiErrorKind {
    Auth,
    RateLimit,
    Server,
    PayloadTooLarge,
    Timeout,
    Format,
    Network,
    NotConfigured,
}

impl AiErrorKind {
    /// Classify an HTTP status returned by the model API
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => AiErrorKind::Auth,
            408 | 504 => AiErrorKind::Timeout,
            413 => AiErrorKind::PayloadTooLarge,
            429 => AiErrorKind::RateLimit,
            400 | 415 | 422 => AiErrorKind::Format,
            _ => AiErrorKind::Server,
        }
    }

    /// Message shown to the end user
    pub fn user_message(self) -> &'static str {
        match self {
            AiErrorKind::Auth => {
                "Erreur d'authentification avec le service d'analyse. Veuillez contacter le support."
            }
            AiErrorKind::RateLimit => {
                "Le service d'analyse est temporairement surchargé. Veuillez réessayer dans quelques instants."
            }
            AiErrorKind::Server => {
                "Le service d'analyse rencontre un problème temporaire. Veuillez réessayer plus tard."
            }
            AiErrorKind::PayloadTooLarge => {
                "Les photos sont trop volumineuses. Veuillez utiliser des images plus légères."
            }
            AiErrorKind::Timeout => {
                "L'analyse a pris trop de temps. Veuillez réessayer avec une meilleure connexion."
            }
            AiErrorKind::Format => {
                "Le format des photos n'est pas pris en charge. Veuillez utiliser des images JPEG ou PNG."
            }
            AiErrorKind::Network => {
                "Impossible de joindre le service d'analyse. Vérifiez votre connexion et réessayez."
            }
            AiErrorKind::NotConfigured => "Le service d'analyse n'est pas configuré.",
        }
    }
}

/// Upstream model error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?} error from vision model: {detail}")]
pub struct AiError {
    pub kind: AiErrorKind,
    pub status: Option<u16>,
    pub detail: String,
}

impl AiError {
    pub fn new(kind: AiErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            detail: detail.into(),
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        Self {
            kind: AiErrorKind::from_status(status),
            status: Some(status.as_u16()),
            detail: body.chars().take(500).collect(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AiError::new(AiErrorKind::Timeout, e.to_string())
        } else if let Some(status) = e.status() {
            AiError::from_status(status, &e.to_string())
        } else if e.is_decode() {
            AiError::new(AiErrorKind::Server, format!("Undecodable response: {}", e))
        } else {
            AiError::new(AiErrorKind::Network, e.to_string())
        }
    }
}

/// A model that answers prompts about photos
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Identifier stored with each scan
    fn model_id(&self) -> &str;

    /// Run one completion and return the reply text
    async fn complete(&self, request: &VisionRequest) -> Result<String, AiError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI chat completions client
pub struct OpenAiClient {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    /// Outbound request budget shared by every handler
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl OpenAiClient {
    pub fn new(settings: &VisionSettings) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AiError::new(AiErrorKind::Network, e.to_string()))?;

        let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_minute(per_minute));

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            rate_limiter,
        })
    }

    fn request_body(&self, request: &VisionRequest) -> Value {
        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        for photo in &request.photos {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": photo.url, "detail": "high" }
            }));
        }

        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": content }
            ],
            "response_format": { "type": "json_object" },
            "temperature": request.temperature,
            "max_tokens": request.max_tokens
        })
    }
}

#[async_trait]
impl VisionModel for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &VisionRequest) -> Result<String, AiError> {
        let Some(api_key) = &self.api_key else {
            return Err(AiError::new(AiErrorKind::NotConfigured, "No vision API key configured"));
        };

        self.rate_limiter.until_ready().await;

        debug!(
            model = %self.model,
            photos = request.photos.len(),
            prompt_chars = request.prompt.len(),
            "Calling vision model"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = AiError::from_status(status, &body);
            warn!(status = status.as_u16(), kind = ?error.kind, "Vision model call failed");
            return Err(error);
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AiError::new(AiErrorKind::Server, "Vision model returned an empty reply"))
    }
}
