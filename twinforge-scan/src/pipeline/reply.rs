//! Structural checks on vision model replies
//!
//! Replies arrive as free text that should contain one JSON object, often
//! wrapped in a markdown code fence. These helpers extract the object and
//! read typed fields out of it, naming the offending field on failure.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Reply did not have the expected structure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplyError {
    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("reply is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' must be {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("field '{0}' is not a finite number")]
    NonFinite(String),
}

impl ReplyError {
    /// Name of the field at fault, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            ReplyError::MissingField(f) | ReplyError::NonFinite(f) => Some(f),
            ReplyError::WrongType { field, .. } => Some(field),
            ReplyError::InvalidJson(_) | ReplyError::NotAnObject => None,
        }
    }
}

/// Remove a surrounding markdown code fence, if present
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse reply text into a JSON object
///
/// Falls back to the outermost `{...}` span when the model surrounded the
/// object with prose.
pub fn parse_json_object(text: &str) -> Result<Map<String, Value>, ReplyError> {
    let body = strip_code_fences(text);
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(first) => {
            let span = body
                .find('{')
                .zip(body.rfind('}'))
                .filter(|(start, end)| start < end)
                .map(|(start, end)| &body[start..=end]);
            match span {
                Some(s) => serde_json::from_str(s).map_err(|e| ReplyError::InvalidJson(e.to_string()))?,
                None => return Err(ReplyError::InvalidJson(first.to_string())),
            }
        }
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ReplyError::NotAnObject),
    }
}

/// Required object of finite numbers
pub fn required_number_map(obj: &Map<String, Value>, field: &str) -> Result<BTreeMap<String, f64>, ReplyError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ReplyError::MissingField(field.to_string())),
        Some(v) => number_map(v, field),
    }
}

/// Optional object of finite numbers, empty when absent
pub fn optional_number_map(obj: &Map<String, Value>, field: &str) -> Result<BTreeMap<String, f64>, ReplyError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(v) => number_map(v, field),
    }
}

fn number_map(value: &Value, field: &str) -> Result<BTreeMap<String, f64>, ReplyError> {
    let Value::Object(map) = value else {
        return Err(ReplyError::WrongType {
            field: field.to_string(),
            expected: "an object of numbers",
        });
    };
    map.iter()
        .map(|(key, v)| {
            let path = format!("{}.{}", field, key);
            finite(v, &path).map(|n| (key.clone(), n))
        })
        .collect()
}

fn finite(value: &Value, path: &str) -> Result<f64, ReplyError> {
    match value.as_f64() {
        Some(n) if n.is_finite() => Ok(n),
        Some(_) => Err(ReplyError::NonFinite(path.to_string())),
        None => Err(ReplyError::WrongType {
            field: path.to_string(),
            expected: "a number",
        }),
    }
}

/// Optional finite number
pub fn optional_number(obj: &Map<String, Value>, field: &str) -> Result<Option<f64>, ReplyError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => finite(v, field).map(Some),
    }
}

/// Optional list of strings, empty when absent
///
/// Non-string entries are rendered with their JSON text rather than rejected.
pub fn optional_string_list(obj: &Map<String, Value>, field: &str) -> Result<Vec<String>, ReplyError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()),
        Some(_) => Err(ReplyError::WrongType {
            field: field.to_string(),
            expected: "an array",
        }),
    }
}

/// Required non-empty string
pub fn required_string(obj: &Map<String, Value>, field: &str) -> Result<String, ReplyError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ReplyError::MissingField(field.to_string())),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(ReplyError::MissingField(field.to_string())),
        Some(_) => Err(ReplyError::WrongType {
            field: field.to_string(),
            expected: "a string",
        }),
    }
}

/// Optional string
pub fn optional_string(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field).and_then(Value::as_str).map(|s| s.trim().to_string())
}
