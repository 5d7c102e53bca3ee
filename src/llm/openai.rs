//! OpenAI-compatible chat completions client.
//!
//! Single-turn requests in JSON mode (`response_format: json_object`); the
//! caller owns the schema and parses `ChatResponse::text`.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::config::LlmConfig;
use super::types::{ChatResponse, LlmChat, LlmError};

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    /// Build a client from a parsed config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| LlmError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, api_key: config.api_key, base_url: config.base_url, model: config.model })
    }

    async fn send_json(&self, path: &str, body: &impl Serialize) -> Result<String, LlmError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::ApiRequest(e.to_string()))?;
        if status != 200 {
            return Err(LlmError::ApiResponse { status, body: text });
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl LlmChat for OpenAiClient {
    async fn complete_json(&self, max_tokens: u32, system: &str, user: &str) -> Result<ChatResponse, LlmError> {
        let messages = [CcMessage { role: "system", content: system }, CcMessage { role: "user", content: user }];
        let body = CcRequest {
            model: &self.model,
            max_tokens,
            messages: &messages,
            response_format: ResponseFormat { format_type: "json_object" },
        };
        let text = self.send_json("/chat/completions", &body).await?;
        parse_chat_completions_response(&text)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct CcRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [CcMessage<'a>],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct CcMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

pub(crate) fn parse_chat_completions_response(json_text: &str) -> Result<ChatResponse, LlmError> {
    let root: Value = serde_json::from_str(json_text).map_err(|e| LlmError::ApiParse(e.to_string()))?;
    let model = root
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_default();
    let input_tokens = root
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = root
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let Some(choice) = root
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
    else {
        return Err(LlmError::ApiParse("chat_completions: missing choices[0]".to_string()));
    };

    if let Some(refusal) = choice
        .get("message")
        .and_then(|m| m.get("refusal"))
        .and_then(Value::as_str)
    {
        return Err(LlmError::ApiParse(format!("model refused: {refusal}")));
    }

    let Some(text) = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
    else {
        return Err(LlmError::ApiParse("chat_completions: empty message content".to_string()));
    };

    Ok(ChatResponse { text: text.to_string(), model, input_tokens, output_tokens })
}

#[cfg(test)]
#[path = "openai_test.rs"]
mod tests;
