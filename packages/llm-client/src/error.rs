//! Error types for the LLM client.

use thiserror::Error;

/// Result type for LLM client operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// LLM client errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Configuration error (missing API key, invalid base URL)
    #[error("configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, timeout)
    #[error("network error: {0}")]
    Network(String),

    /// API error (non-2xx response, rate limit, invalid request)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Parse error (invalid JSON, unexpected response format)
    #[error("parse error: {0}")]
    Parse(String),
}

impl LlmError {
    /// Whether a retry with backoff could plausibly succeed.
    ///
    /// Rate limits, server errors, and transport failures are retryable;
    /// auth failures and malformed requests are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Network("timeout".into()).is_retryable());
        assert!(LlmError::Api { status: 429, message: "rate limit".into() }.is_retryable());
        assert!(LlmError::Api { status: 503, message: "overloaded".into() }.is_retryable());
        assert!(!LlmError::Api { status: 401, message: "bad key".into() }.is_retryable());
        assert!(!LlmError::Parse("not json".into()).is_retryable());
        assert!(!LlmError::Config("no key".into()).is_retryable());
    }
}
