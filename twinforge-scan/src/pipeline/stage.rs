//! Per-stage pipeline result
//!
//! Each stage of a scan travels to the commit step as a tagged value, so a
//! consumer has to say what it does with a stage that never ran or failed.

use serde::{Deserialize, Serialize};

/// Outcome of one pipeline stage
///
/// Serialized as `{"status": "pending"}`, `{"status": "ready", "data": ...}`
/// or `{"status": "failed", "reason": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStage<T> {
    Pending,
    Ready { data: T },
    Failed { reason: String },
}

impl<T> Default for PipelineStage<T> {
    fn default() -> Self {
        PipelineStage::Pending
    }
}

impl<T> PipelineStage<T> {
    pub fn ready(data: T) -> Self {
        PipelineStage::Ready { data }
    }

    pub fn as_ready(&self) -> Option<&T> {
        match self {
            PipelineStage::Ready { data } => Some(data),
            PipelineStage::Pending | PipelineStage::Failed { .. } => None,
        }
    }

    /// Data of a ready stage, or a description of why it is not ready
    pub fn require(&self, stage: &str) -> Result<&T, String> {
        match self {
            PipelineStage::Ready { data } => Ok(data),
            PipelineStage::Pending => Err(format!("{} stage has not completed", stage)),
            PipelineStage::Failed { reason } => Err(format!("{} stage failed: {}", stage, reason)),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            PipelineStage::Pending => "pending",
            PipelineStage::Ready { .. } => "ready",
            PipelineStage::Failed { .. } => "failed",
        }
    }
}
