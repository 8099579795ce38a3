//! Scan stage services
//!
//! One module per endpoint. Each takes the shared [`crate::AppState`] and a
//! parsed request and returns the response body; the HTTP layer only
//! extracts, delegates and records errors.

pub mod commit;
pub mod estimate;
pub mod matching;
pub mod refinement;
pub mod semantic;
pub mod vision;

pub use vision::{AiError, AiErrorKind, OpenAiClient, PhotoInput, VisionModel, VisionRequest};

use crate::error::ApiError;
use twinforge_common::Gender;

/// Parse a gender field from a request body
pub(crate) fn parse_gender(field: &str, value: &str) -> Result<Gender, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{}: unknown gender '{}'", field, value)))
}

/// Reject blank user ids
pub(crate) fn require_user_id(user_id: &str) -> Result<(), ApiError> {
    if user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }
    Ok(())
}
