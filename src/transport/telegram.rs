//! Telegram Bot API client.
//!
//! Only the methods the gate needs: `sendMessage`, `editMessageText`,
//! `answerCallbackQuery` and `sendChatAction`. Controls map onto inline keyboards; editing
//! without controls drops the keyboard.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Controls, MessageRef, Transport, TransportError};

const REQUEST_TIMEOUT_SECS: u64 = 15;
const CONNECT_TIMEOUT_SECS: u64 = 5;

pub struct TelegramTransport {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramTransport {
    /// Build a client for `bot_token` against `api_base` (normally
    /// `https://api.telegram.org`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(api_base: &str, bot_token: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| TransportError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: bot_url(api_base, bot_token) })
    }

    async fn call<B, R>(&self, method: &str, body: &B) -> Result<R, TransportError>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let response = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        parse_api_response(status, &text)
    }
}

#[async_trait::async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, chat_id: i64, text: &str, controls: Option<&Controls>) -> Result<MessageRef, TransportError> {
        let body = SendMessage { chat_id, text, reply_markup: controls.map(InlineKeyboard::from) };
        let sent: SentMessage = self.call("sendMessage", &body).await?;
        Ok(MessageRef { chat_id: sent.chat.id, message_id: sent.message_id })
    }

    async fn edit(&self, message: MessageRef, text: &str, controls: Option<&Controls>) -> Result<(), TransportError> {
        let body = EditMessageText {
            chat_id: message.chat_id,
            message_id: message.message_id,
            text,
            reply_markup: controls.map(InlineKeyboard::from),
        };
        // `result` is either the edited Message or `true`; neither is needed.
        match self.call::<_, serde_json::Value>("editMessageText", &body).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>, alert: bool) -> Result<(), TransportError> {
        let body = AnswerCallbackQuery { callback_query_id: callback_id, text, show_alert: alert };
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn typing(&self, chat_id: i64) -> Result<(), TransportError> {
        let body = SendChatAction { chat_id, action: "typing" };
        let _: bool = self.call("sendChatAction", &body).await?;
        Ok(())
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard<'a>>,
}

#[derive(Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard<'a>>,
}

#[derive(Serialize)]
struct AnswerCallbackQuery<'a> {
    callback_query_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    show_alert: bool,
}

#[derive(Serialize)]
struct SendChatAction<'a> {
    chat_id: i64,
    action: &'a str,
}

#[derive(Serialize)]
struct InlineKeyboard<'a> {
    inline_keyboard: &'a [Vec<super::Button>],
}

impl<'a> From<&'a Controls> for InlineKeyboard<'a> {
    fn from(controls: &'a Controls) -> Self {
        Self { inline_keyboard: &controls.rows }
    }
}

#[derive(Deserialize)]
struct ApiResponse<R> {
    ok: bool,
    result: Option<R>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
    chat: SentChat,
}

#[derive(Deserialize)]
struct SentChat {
    id: i64,
}

// =============================================================================
// HELPERS
// =============================================================================

/// Editing a message to its current text is rejected by the API; the message
/// already shows what we wanted.
fn is_not_modified(e: &TransportError) -> bool {
    matches!(e, TransportError::Rejected { status: 400, description } if description.contains("message is not modified"))
}

fn bot_url(api_base: &str, bot_token: &str) -> String {
    format!("{}/bot{bot_token}", api_base.trim_end_matches('/'))
}

fn parse_api_response<R>(status: u16, body: &str) -> Result<R, TransportError>
where
    R: for<'de> Deserialize<'de>,
{
    let parsed: ApiResponse<R> = serde_json::from_str(body).map_err(|e| {
        if status == 200 {
            TransportError::Parse(e.to_string())
        } else {
            TransportError::Rejected { status, description: body.to_string() }
        }
    })?;

    if !parsed.ok {
        return Err(TransportError::Rejected {
            status,
            description: parsed.description.unwrap_or_default(),
        });
    }
    parsed
        .result
        .ok_or_else(|| TransportError::Parse("missing result".into()))
}

#[cfg(test)]
#[path = "telegram_test.rs"]
mod tests;
