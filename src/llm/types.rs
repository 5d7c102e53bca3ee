//! LLM types — provider-neutral request/response shapes and errors.

use serde::{Deserialize, Serialize};

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by LLM client operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The required API key environment variable is not set.
    #[error("missing API key: env var {var} not set")]
    MissingApiKey { var: String },

    /// The HTTP request to the LLM provider failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// The LLM provider returned a non-success HTTP status.
    #[error("API response error: status {status}")]
    ApiResponse { status: u16, body: String },

    /// The LLM provider response body could not be deserialized.
    #[error("API response parse failed: {0}")]
    ApiParse(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl crate::error::ErrorCode for LlmError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingApiKey { .. } => "E_MISSING_API_KEY",
            Self::ApiRequest(_) => "E_API_REQUEST",
            Self::ApiResponse { .. } => "E_API_RESPONSE",
            Self::ApiParse(_) => "E_API_PARSE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::ApiRequest(_) | Self::ApiResponse { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Response from a single-turn JSON completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Raw assistant text; a JSON object when JSON mode is honored.
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// =============================================================================
// LLM CHAT TRAIT
// =============================================================================

/// Provider-neutral async trait for LLM chat. Enables mocking in tests.
#[async_trait::async_trait]
pub trait LlmChat: Send + Sync {
    /// Send `system` + `user` and ask the provider for a JSON object reply.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the request fails or the response is malformed.
    async fn complete_json(&self, max_tokens: u32, system: &str, user: &str) -> Result<ChatResponse, LlmError>;
}
