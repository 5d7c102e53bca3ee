//! LLM configuration parsed from environment variables.

use super::types::LlmError;
use crate::config::env_parse;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LLM_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LLM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LLM_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlmTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub timeouts: LlmTimeouts,
}

impl LlmConfig {
    /// Build typed LLM config from environment variables.
    ///
    /// - `LLM_API_KEY_ENV`: names the env var holding the key (default `OPENAI_API_KEY`)
    /// - `LLM_MODEL`: default `gpt-4o-mini`
    /// - `LLM_OPENAI_BASE_URL`: default OpenAI API base URL
    /// - `LLM_MAX_TOKENS`: default 1024
    /// - `LLM_REQUEST_TIMEOUT_SECS`: default 30
    /// - `LLM_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns `MissingApiKey` if the named key variable is unset or empty.
    pub fn from_env() -> Result<Self, LlmError> {
        let key_var = std::env::var("LLM_API_KEY_ENV").unwrap_or_else(|_| DEFAULT_API_KEY_ENV.to_string());
        let api_key = std::env::var(&key_var)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LlmError::MissingApiKey { var: key_var.clone() })?;

        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url = std::env::var("LLM_OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let timeouts = LlmTimeouts {
            request_secs: env_parse("LLM_REQUEST_TIMEOUT_SECS", DEFAULT_LLM_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse("LLM_CONNECT_TIMEOUT_SECS", DEFAULT_LLM_CONNECT_TIMEOUT_SECS),
        };

        Ok(Self { api_key, model, base_url, max_tokens: env_parse("LLM_MAX_TOKENS", DEFAULT_LLM_MAX_TOKENS), timeouts })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
