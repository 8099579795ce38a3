//! Shared helpers for twinforge-scan integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use twinforge_scan::config::ServiceSettings;
use twinforge_scan::services::{AiError, AiErrorKind, VisionModel, VisionRequest};
use twinforge_scan::{build_router, AppState};

pub const MOCK_USER: &str = "mock-user-0000";

/// Vision model that replays canned replies in order
pub struct ScriptedVision {
    replies: Mutex<VecDeque<Result<String, AiError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedVision {
    pub fn new(replies: Vec<Result<String, AiError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(kind: AiErrorKind) -> Arc<Self> {
        Self::new(vec![Err(AiError::new(kind, "scripted failure"))])
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionModel for ScriptedVision {
    fn model_id(&self) -> &str {
        "scripted-vision"
    }

    async fn complete(&self, request: &VisionRequest) -> Result<String, AiError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AiError::new(AiErrorKind::Server, "no scripted reply left")))
    }
}

/// App state over a fresh seeded in-memory database
pub async fn test_state(vision: Arc<ScriptedVision>) -> AppState {
    let settings = ServiceSettings {
        mock_user_id: Some(MOCK_USER.to_string()),
        ..ServiceSettings::default()
    };
    let db = twinforge_common::db::open_in_memory().await.unwrap();
    let vision: Arc<dyn VisionModel> = vision;
    AppState::new(db, vision, settings)
}

pub async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

pub async fn post_json(state: &AppState, uri: &str, body: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(state, request).await
}

pub fn photos() -> Value {
    serde_json::json!([
        {"view": "front", "url": "https://cdn.example.test/scan/front.jpg"},
        {"view": "profile", "url": "https://cdn.example.test/scan/profile.jpg"}
    ])
}
