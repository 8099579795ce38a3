//! Error types for twinforge-scan
//!
//! Every error leaves the service as JSON with a human-readable `error`
//! string and a stable `code`. Server-side failures add `details`.

use crate::pipeline::ReplyError;
use crate::services::vision::AiError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or incomplete request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. a scan id that already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Vision model call failed (500)
    #[error("Upstream AI error: {0}")]
    Upstream(#[from] AiError),

    /// Vision model reply was structurally invalid (500)
    #[error("Invalid AI reply: {0}")]
    Parse(#[from] ReplyError),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// twinforge-common error
    #[error("Common error: {0}")]
    Common(twinforge_common::Error),
}

impl From<twinforge_common::Error> for ApiError {
    fn from(e: twinforge_common::Error) -> Self {
        match e {
            twinforge_common::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            twinforge_common::Error::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Common(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) | ApiError::Parse(_) | ApiError::Internal(_) | ApiError::Common(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest(msg) => json!({ "error": msg, "code": "BAD_REQUEST" }),
            ApiError::Conflict(msg) => json!({ "error": msg, "code": "CONFLICT" }),
            ApiError::Upstream(err) => json!({
                "error": err.user_message(),
                "code": "UPSTREAM_AI_ERROR",
                "kind": err.kind,
                "details": err.detail,
            }),
            ApiError::Parse(err) => json!({
                "error": "Réponse de l'analyse invalide",
                "code": "AI_REPLY_INVALID",
                "field": err.field(),
                "details": err.to_string(),
            }),
            ApiError::Internal(msg) => json!({
                "error": "Internal server error",
                "code": "INTERNAL_ERROR",
                "details": msg,
            }),
            ApiError::Common(err) => json!({
                "error": "Internal server error",
                "code": "COMMON_ERROR",
                "details": err.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vision::AiErrorKind;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(twinforge_common::Error::Conflict("dup".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(twinforge_common::Error::InvalidInput("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(AiError::new(AiErrorKind::RateLimit, "slow down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(ReplyError::MissingField("final_limb_masses".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
