//! Outbound chat transport.
//!
//! DESIGN
//! ======
//! The gate only needs three verbs: send a message, rewrite one it sent
//! earlier, and acknowledge a button press. `Transport` keeps those behind a
//! trait so the edit-session timer and the meal flow can be driven by a
//! recording mock in tests; `TelegramTransport` is the production client.

pub mod telegram;

use serde::{Deserialize, Serialize};

pub use telegram::TelegramTransport;

// =============================================================================
// TYPES
// =============================================================================

/// Address of a message previously sent by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// A single inline button. `data` is echoed back in the callback query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    #[serde(rename = "callback_data")]
    pub data: String,
}

impl Button {
    #[must_use]
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self { text: text.into(), data: data.into() }
    }
}

/// Interactive controls attached to a message, laid out as rows of buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controls {
    pub rows: Vec<Vec<Button>>,
}

impl Controls {
    #[must_use]
    pub fn row(buttons: Vec<Button>) -> Self {
        Self { rows: vec![buttons] }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request to the chat API failed before a response arrived.
    #[error("transport request failed: {0}")]
    Request(String),

    /// The chat API rejected the call (e.g. the message no longer exists).
    #[error("transport rejected call: status {status}: {description}")]
    Rejected { status: u16, description: String },

    /// The chat API response could not be decoded.
    #[error("transport response parse failed: {0}")]
    Parse(String),

    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl crate::error::ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Request(_) => "E_TRANSPORT_REQUEST",
            Self::Rejected { .. } => "E_TRANSPORT_REJECTED",
            Self::Parse(_) => "E_TRANSPORT_PARSE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// TRANSPORT TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `text` to `chat_id`, optionally with inline controls.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the chat API call fails.
    async fn send(&self, chat_id: i64, text: &str, controls: Option<&Controls>) -> Result<MessageRef, TransportError>;

    /// Replace the text of a sent message. `None` removes any controls.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the message is gone or the call fails.
    async fn edit(&self, message: MessageRef, text: &str, controls: Option<&Controls>) -> Result<(), TransportError>;

    /// Acknowledge a button press, optionally showing `text` to the user.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the call fails.
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>, alert: bool) -> Result<(), TransportError>;

    /// Show a short-lived "typing" indicator in `chat_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the call fails.
    async fn typing(&self, chat_id: i64) -> Result<(), TransportError>;
}

// =============================================================================
// TEST SUPPORT
// =============================================================================
