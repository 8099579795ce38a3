//! HTTP routing and error shape tests

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{post_json, send, test_state, ScriptedVision};
use serde_json::json;
use twinforge_scan::services::AiErrorKind;

const SCAN_ENDPOINTS: &[&str] = &[
    "/scan-estimate",
    "/scan-semantic",
    "/scan-match",
    "/scan-refine-morphs",
    "/scan-commit",
];

#[tokio::test]
async fn test_options_preflight_is_ok() {
    let state = test_state(ScriptedVision::new(Vec::new())).await;
    for uri in SCAN_ENDPOINTS {
        let request = Request::builder().method("OPTIONS").uri(*uri).body(Body::empty()).unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK, "OPTIONS {}", uri);
    }
}

#[tokio::test]
async fn test_cors_preflight_allows_any_origin() {
    let state = test_state(ScriptedVision::new(Vec::new())).await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/scan-commit")
        .header("origin", "https://app.example.test")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = {
        use tower::ServiceExt;
        twinforge_scan::build_router(state).oneshot(request).await.unwrap()
    };
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_other_methods_are_rejected() {
    let state = test_state(ScriptedVision::new(Vec::new())).await;
    for method in ["GET", "PUT", "DELETE"] {
        let request = Request::builder().method(method).uri("/scan-commit").body(Body::empty()).unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{} /scan-commit", method);
    }
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let state = test_state(ScriptedVision::new(Vec::new())).await;
    let request = Request::builder()
        .method("POST")
        .uri("/scan-estimate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_incomplete_body_is_bad_request() {
    let state = test_state(ScriptedVision::new(Vec::new())).await;
    let (status, body) = post_json(&state, "/scan-estimate", &json!({"user_id": "u1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("user_declared"));
}

#[tokio::test]
async fn test_unknown_gender_is_bad_request() {
    let state = test_state(ScriptedVision::new(Vec::new())).await;
    let (status, body) = post_json(
        &state,
        "/scan-match",
        &json!({
            "resolved_gender": "robot",
            "obesity": "Non obèse", "muscularity": "Normal", "level": "Normal", "morphotype": "REC"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("robot"));
}

#[tokio::test]
async fn test_health_reports_last_server_error() {
    let state = test_state(ScriptedVision::failing(AiErrorKind::Auth)).await;

    let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&state, health).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "twinforge-scan");
    assert_eq!(body["database"], "connected");
    assert_eq!(body["vision_model"], "scripted-vision");
    assert!(body.get("last_error").is_none());

    let (status, body) = post_json(
        &state,
        "/scan-semantic",
        &json!({
            "user_id": "u1",
            "photos": common::photos(),
            "user_declared_gender": "masculine",
            "estimated_bmi": 24.0
        }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "UPSTREAM_AI_ERROR");
    assert_eq!(body["kind"], "auth");
    assert!(body["error"].as_str().unwrap().contains("authentification"));

    let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (_, body) = send(&state, health).await;
    assert!(body["last_error"].as_str().unwrap().contains("Upstream AI error"));
}
