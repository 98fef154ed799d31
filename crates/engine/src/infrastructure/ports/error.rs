//! Error types used inside inference adapters.
//!
//! These never cross the `InferencePort` boundary: adapters log them and
//! hand back `None` (or a closed token stream) instead.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("LLM request failed: {0}")]
    RequestFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Generation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Generation cancelled")]
    Cancelled,
    #[error("Model load failed: {0}")]
    ModelLoad(String),
}

impl InferenceError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn request_failed(msg: impl ToString) -> Self {
        Self::RequestFailed(msg.to_string())
    }

    pub fn invalid_response(msg: impl ToString) -> Self {
        Self::InvalidResponse(msg.to_string())
    }

    /// Cancellation by the caller is final; everything else may be retried
    /// against the fallback model.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
