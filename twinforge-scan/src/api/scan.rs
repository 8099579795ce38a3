//! Scan pipeline endpoints
//!
//! POST /scan-estimate, /scan-semantic, /scan-match, /scan-refine-morphs and
//! /scan-commit. Each also answers OPTIONS for CORS preflight; any other
//! method gets 405 from the router.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use tracing::{debug, error};

use crate::services::commit::{run_commit, CommitRequest, CommitResponse};
use crate::services::estimate::{run_estimate, EstimateRequest, EstimateResponse};
use crate::services::matching::{run_match, MatchRequest, MatchResponse};
use crate::services::refinement::{run_refinement, RefineRequest, RefineResponse};
use crate::services::semantic::{run_semantic, SemanticRequest, SemanticResponse};
use crate::{ApiResult, AppState};

/// Wrap a service result, remembering server-side failures
async fn respond<T>(state: &AppState, endpoint: &str, result: ApiResult<T>) -> ApiResult<Json<T>> {
    match result {
        Ok(body) => Ok(Json(body)),
        Err(e) => {
            if e.status().is_server_error() {
                error!(endpoint, error = %e, "Request failed");
            } else {
                debug!(endpoint, error = %e, "Request rejected");
            }
            state.record_error(&e).await;
            Err(e)
        }
    }
}

/// POST /scan-estimate
pub async fn scan_estimate(
    State(state): State<AppState>,
    payload: Result<Json<EstimateRequest>, JsonRejection>,
) -> ApiResult<Json<EstimateResponse>> {
    let Json(request) = payload?;
    let result = run_estimate(&state, request).await;
    respond(&state, "scan-estimate", result).await
}

/// POST /scan-semantic
pub async fn scan_semantic(
    State(state): State<AppState>,
    payload: Result<Json<SemanticRequest>, JsonRejection>,
) -> ApiResult<Json<SemanticResponse>> {
    let Json(request) = payload?;
    let result = run_semantic(&state, request).await;
    respond(&state, "scan-semantic", result).await
}

/// POST /scan-match
pub async fn scan_match(
    State(state): State<AppState>,
    payload: Result<Json<MatchRequest>, JsonRejection>,
) -> ApiResult<Json<MatchResponse>> {
    let Json(request) = payload?;
    let result = run_match(&state, request).await;
    respond(&state, "scan-match", result).await
}

/// POST /scan-refine-morphs
pub async fn scan_refine_morphs(
    State(state): State<AppState>,
    payload: Result<Json<RefineRequest>, JsonRejection>,
) -> ApiResult<Json<RefineResponse>> {
    let Json(request) = payload?;
    let result = run_refinement(&state, request).await;
    respond(&state, "scan-refine-morphs", result).await
}

/// POST /scan-commit
pub async fn scan_commit(
    State(state): State<AppState>,
    payload: Result<Json<CommitRequest>, JsonRejection>,
) -> ApiResult<Json<CommitResponse>> {
    let Json(request) = payload?;
    let result = run_commit(&state, request).await;
    respond(&state, "scan-commit", result).await
}

/// OPTIONS on any scan endpoint
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// Build scan routes
pub fn scan_routes() -> Router<AppState> {
    Router::new()
        .route("/scan-estimate", post(scan_estimate).options(preflight))
        .route("/scan-semantic", post(scan_semantic).options(preflight))
        .route("/scan-match", post(scan_match).options(preflight))
        .route("/scan-refine-morphs", post(scan_refine_morphs).options(preflight))
        .route("/scan-commit", post(scan_commit).options(preflight))
}
