//! Webhook endpoint — decodes chat updates and hands them to the meal service.
//!
//! ERROR HANDLING
//! ==============
//! Anything past the secret check is answered `200 OK`, including bodies we
//! cannot decode and handler failures. A non-2xx makes the platform
//! redeliver the same update, which would only repeat the failure.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::ErrorCode;
use crate::services::meal::{CallbackAction, IncomingCallback, IncomingText, MealOutcome};
use crate::state::AppState;
use crate::transport::MessageRef;

// =============================================================================
// WIRE TYPES
// =============================================================================

/// The subset of a Telegram `Update` the bot reacts to.
#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<CallbackMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMessage {
    pub message_id: i64,
    pub chat: Chat,
}

// =============================================================================
// HANDLER
// =============================================================================

pub async fn receive(State(state): State<AppState>, Path(secret): Path<String>, body: Bytes) -> StatusCode {
    if !secrets_match(secret.as_bytes(), state.webhook_secret.as_bytes()) {
        warn!("webhook called with wrong secret");
        return StatusCode::FORBIDDEN;
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "webhook body is not an update");
            return StatusCode::OK;
        }
    };

    let update_id = update.update_id;
    match dispatch(&state, update).await {
        Ok(Some(outcome)) => debug!(update_id, ?outcome, "update handled"),
        Ok(None) => debug!(update_id, "update ignored"),
        Err(e) => error!(update_id, error = %e, code = e.error_code(), retryable = e.retryable(), "update handling failed"),
    }
    StatusCode::OK
}

async fn dispatch(
    state: &AppState,
    update: Update,
) -> Result<Option<MealOutcome>, crate::services::meal::MealError> {
    if let Some(cb) = update.callback_query {
        let Some(action) = cb.data.as_deref().and_then(CallbackAction::parse) else {
            state.meals.acknowledge(&cb.id).await?;
            return Ok(None);
        };
        let incoming = IncomingCallback {
            callback_id: cb.id,
            user_id: cb.from.id,
            message: cb
                .message
                .map(|m| MessageRef { chat_id: m.chat.id, message_id: m.message_id }),
            action,
        };
        return state.meals.handle_callback(incoming).await.map(Some);
    }

    let Some(message) = update.message else {
        return Ok(None);
    };
    let Some(from) = message.from else {
        return Ok(None);
    };
    match message.text {
        Some(text) if text.starts_with('/') => Ok(None),
        Some(text) => {
            let incoming =
                IncomingText { user_id: from.id, chat_id: message.chat.id, message_id: message.message_id, text };
            state.meals.handle_text(incoming).await.map(Some)
        }
        None => state.meals.reject_unsupported(message.chat.id).await.map(Some),
    }
}

fn secrets_match(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len() && given.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
#[path = "webhook_test.rs"]
mod tests;
