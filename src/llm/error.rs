//! LLM error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during LLM gateway calls
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited (HTTP 429)")]
    RateLimited,

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(reqwest::Error),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Exhausted {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl LlmError {
    /// Classify a transport error, keeping timeouts distinct from other
    /// network failures.
    pub fn from_transport(error: reqwest::Error, call_timeout: Duration) -> Self {
        if error.is_timeout() {
            LlmError::Timeout(call_timeout)
        } else {
            LlmError::Network(error)
        }
    }

    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited)
    }

    /// Check if a retry could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited => true,
            LlmError::ApiError { status, .. } => *status >= 500 || *status == 408,
            LlmError::Network(_) => true,
            LlmError::Timeout(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::Json(_) => false,
            LlmError::RetriesExhausted { .. } => false,
        }
    }
}
