//! LLM — inference provider adapter.
//!
//! DESIGN
//! ======
//! The gate treats inference as an opaque, slow, fallible call. `LlmChat` is
//! the seam; `OpenAiClient` is the only provider. Missing configuration is
//! not fatal: `from_env` returns an error and startup runs without AI.

pub mod config;
pub mod openai;
pub mod types;

use std::sync::Arc;

use config::LlmConfig;
pub use openai::OpenAiClient;
pub use types::{ChatResponse, LlmChat, LlmError};

/// A ready provider plus the per-request output budget.
#[derive(Clone)]
pub struct LlmHandle {
    pub chat: Arc<dyn LlmChat>,
    pub model: String,
    pub max_tokens: u32,
}

/// Build the configured provider from environment variables.
///
/// # Errors
///
/// Returns an error if the API key is missing or the HTTP client fails.
pub fn from_env() -> Result<LlmHandle, LlmError> {
    let config = LlmConfig::from_env()?;
    let model = config.model.clone();
    let max_tokens = config.max_tokens;
    let client = OpenAiClient::new(config)?;
    Ok(LlmHandle { chat: Arc::new(client), model, max_tokens })
}
