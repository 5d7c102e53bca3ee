//! Meal service — logs meals from free text and drives corrections.
//!
//! ARCHITECTURE
//! ============
//! Every inbound action lands here after the webhook has decoded it:
//!
//! ```text
//! text ──► live correction? ── finalize, re-check edit window
//!              │
//!              ▼
//!          precheck ──► RateLimiter::check ──► processing message
//!              ──► ConcurrencyGuard::with_slot(inference, typing heartbeat)
//!              ──► sanity check ──► create / update ──► saved summary
//! ```
//!
//! "Edit" on a saved meal opens an `EditSession`; its prompt carries
//! keep/delete buttons bound to the session token. A correction text
//! consumes the session via `finalize` and re-enters the flow above.
//!
//! ERROR HANDLING
//! ==============
//! Throttled, busy, stale and rejected inputs are `MealOutcome`s, each with
//! its own reply. Inference and persistence failures leave a best-effort
//! reply on the processing message and then propagate as `MealError`; the
//! concurrency slot is already released by then.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::edit_session::{ActOutcome, ActionKind, EditSessionError, EditSessionManager, SessionToken};
use super::nutrition::{AnalysisAction, NutritionAnalysis, NutritionAnalyzer, sanity_check};
use super::precheck::{self, Rejection};
use crate::concurrency::ConcurrencyGuard;
use crate::config::GateConfig;
use crate::db::meals::{MealRecord, MealRepo, NewMeal, RepoError};
use crate::error::{ErrorCode, UserId};
use crate::llm::LlmError;
use crate::rate_limit::RateLimiter;
use crate::texts;
use crate::transport::{Button, Controls, MessageRef, Transport, TransportError};

/// Telegram clears a chat action after about 5 s.
const TYPING_INTERVAL: Duration = Duration::from_secs(4);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MealError {
    #[error("inference failed: {0}")]
    Inference(#[from] LlmError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] EditSessionError),
}

impl ErrorCode for MealError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Inference(e) => e.error_code(),
            Self::Repo(e) => e.error_code(),
            Self::Transport(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Inference(e) => e.retryable(),
            Self::Repo(e) => e.retryable(),
            Self::Transport(e) => e.retryable(),
            Self::Session(e) => e.retryable(),
        }
    }
}

/// What happened to an inbound action. Every variant has already been
/// reported to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MealOutcome {
    Rejected(Rejection),
    Throttled,
    Busy,
    /// Inference unavailable or the model could not tell what this is.
    Unrecognized,
    ModelRejected(AnalysisAction),
    ImplausibleValues,
    AlreadySaved,
    Saved { meal_id: Uuid },
    Updated { meal_id: Uuid },
    MealNotFound,
    WindowClosed,
    CorrectionStarted { meal_id: Uuid, token: SessionToken },
    CorrectionKept { meal_id: Uuid },
    Deleted { meal_id: Uuid },
    /// Button from a correction session that already ended.
    Stale,
}

/// A text message from a user.
#[derive(Debug, Clone)]
pub struct IncomingText {
    pub user_id: UserId,
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
}

/// Decoded inline-button payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    EditSaved(Uuid),
    DeleteSaved(Uuid),
    KeepCorrection(SessionToken),
    DeleteCorrection(SessionToken),
}

impl CallbackAction {
    /// Parse `saved_edit:<id>`, `saved_delete:<id>`, `fb_ok:<token>` or
    /// `fb_del:<token>`.
    #[must_use]
    pub fn parse(data: &str) -> Option<Self> {
        let (kind, arg) = data.split_once(':')?;
        if arg.is_empty() {
            return None;
        }
        match kind {
            "saved_edit" => Uuid::parse_str(arg).ok().map(Self::EditSaved),
            "saved_delete" => Uuid::parse_str(arg).ok().map(Self::DeleteSaved),
            "fb_ok" => Some(Self::KeepCorrection(SessionToken::from(arg))),
            "fb_del" => Some(Self::DeleteCorrection(SessionToken::from(arg))),
            _ => None,
        }
    }
}

/// A button press on one of the bot's messages.
#[derive(Debug, Clone)]
pub struct IncomingCallback {
    pub callback_id: String,
    pub user_id: UserId,
    /// Message carrying the button; absent when it is too old for the platform.
    pub message: Option<MessageRef>,
    pub action: CallbackAction,
}

#[must_use]
pub fn saved_controls(meal_id: Uuid) -> Controls {
    Controls::row(vec![
        Button::new(texts::BUTTON_EDIT, format!("saved_edit:{meal_id}")),
        Button::new(texts::BUTTON_DELETE, format!("saved_delete:{meal_id}")),
    ])
}

#[must_use]
pub fn correction_controls(token: &SessionToken) -> Controls {
    Controls::row(vec![
        Button::new(texts::BUTTON_KEEP, format!("fb_ok:{token}")),
        Button::new(texts::BUTTON_DELETE, format!("fb_del:{token}")),
    ])
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct MealService {
    limiter: RateLimiter,
    guard: ConcurrencyGuard,
    sessions: EditSessionManager,
    meals: Arc<dyn MealRepo>,
    transport: Arc<dyn Transport>,
    analyzer: Option<Arc<dyn NutritionAnalyzer>>,
    gate: GateConfig,
}

impl MealService {
    #[must_use]
    pub fn new(
        gate: GateConfig,
        meals: Arc<dyn MealRepo>,
        transport: Arc<dyn Transport>,
        analyzer: Option<Arc<dyn NutritionAnalyzer>>,
    ) -> Self {
        Self {
            limiter: RateLimiter::from_config(&gate),
            guard: ConcurrencyGuard::new(gate.max_concurrent_per_user),
            sessions: EditSessionManager::new(Arc::clone(&transport), Arc::clone(&meals)),
            meals,
            transport,
            analyzer,
            gate,
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &EditSessionManager {
        &self.sessions
    }

    /// Route a callback to the matching handler.
    ///
    /// # Errors
    ///
    /// Propagates repository and transport failures.
    pub async fn handle_callback(&self, cb: IncomingCallback) -> Result<MealOutcome, MealError> {
        match cb.action.clone() {
            CallbackAction::EditSaved(meal_id) => self.start_correction(&cb, meal_id).await,
            CallbackAction::DeleteSaved(meal_id) => self.delete_saved(&cb, meal_id).await,
            CallbackAction::KeepCorrection(token) => self.handle_feedback(&cb, &token, ActionKind::Resolve).await,
            CallbackAction::DeleteCorrection(token) => self.handle_feedback(&cb, &token, ActionKind::Delete).await,
        }
    }

    /// Log a meal from text, or apply it as the correction for a live session.
    ///
    /// # Errors
    ///
    /// Returns `MealError` when inference, persistence or the transport fail.
    pub async fn handle_text(&self, msg: IncomingText) -> Result<MealOutcome, MealError> {
        let mut edit_target = None;
        if let Some(session) = self.sessions.finalize(msg.user_id) {
            let Some(meal) = self.meals.get(session.target_id, msg.user_id).await? else {
                self.reply(&msg, texts::MEAL_NOT_FOUND).await?;
                return Ok(MealOutcome::MealNotFound);
            };
            if older_than(&meal, self.gate.edit_window) {
                self.reply(&msg, &texts::edit_window_expired(whole_hours(self.gate.edit_window)))
                    .await?;
                return Ok(MealOutcome::WindowClosed);
            }
            edit_target = Some(meal.id);
        }

        if let Some(rejection) = precheck::check_text(&msg.text) {
            self.reply(&msg, rejection.message()).await?;
            return Ok(MealOutcome::Rejected(rejection));
        }

        if !self.limiter.check(msg.user_id) {
            info!(user_id = msg.user_id, "meal request throttled");
            self.reply(&msg, texts::THROTTLED).await?;
            return Ok(MealOutcome::Throttled);
        }

        let processing_text = if edit_target.is_some() { texts::PROCESSING_EDIT } else { texts::PROCESSING_NEW };
        let processing = self.transport.send(msg.chat_id, processing_text, None).await?;

        let analysis = match self.analyze(&msg).await {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(outcome)) => {
                let text = if outcome == MealOutcome::Busy { texts::BUSY } else { texts::UNRECOGNIZED };
                self.transport.edit(processing, text, None).await?;
                return Ok(outcome);
            }
            Err(e) => {
                warn!(user_id = msg.user_id, error = %e, code = e.error_code(), "nutrition analysis failed");
                self.edit_best_effort(processing, texts::UNRECOGNIZED).await;
                return Err(e.into());
            }
        };

        match analysis.action {
            AnalysisAction::Save => {}
            AnalysisAction::RejectUnrecognized => {
                self.transport.edit(processing, texts::UNRECOGNIZED, None).await?;
                return Ok(MealOutcome::Unrecognized);
            }
            other => {
                let text = analysis.user_message.as_deref().unwrap_or(texts::UNRECOGNIZED);
                self.transport.edit(processing, text, None).await?;
                return Ok(MealOutcome::ModelRejected(other));
            }
        }

        if let Some(reason) = sanity_check(&analysis) {
            warn!(user_id = msg.user_id, %reason, "nutrition sanity check failed");
            self.transport.edit(processing, texts::SANITY_FAIL, None).await?;
            return Ok(MealOutcome::ImplausibleValues);
        }

        let outcome = match self.persist(&msg, edit_target, &analysis).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.edit_best_effort(processing, texts::INTERNAL_ERROR).await;
                return Err(e.into());
            }
        };
        match &outcome {
            MealOutcome::Saved { meal_id } | MealOutcome::Updated { meal_id } => {
                let controls = saved_controls(*meal_id);
                self.transport
                    .edit(processing, &texts::meal_saved(&analysis), Some(&controls))
                    .await?;
            }
            MealOutcome::AlreadySaved => self.transport.edit(processing, texts::ALREADY_SAVED, None).await?,
            _ => self.transport.edit(processing, texts::MEAL_NOT_FOUND, None).await?,
        }
        Ok(outcome)
    }

    /// Inference under the user's concurrency slot. `Ok(Err(_))` carries a
    /// non-error outcome (busy or no analyzer configured).
    async fn analyze(&self, msg: &IncomingText) -> Result<Result<NutritionAnalysis, MealOutcome>, LlmError> {
        let Some(analyzer) = &self.analyzer else {
            return Ok(Err(MealOutcome::Unrecognized));
        };
        match self
            .guard
            .with_slot(msg.user_id, || self.with_typing(msg.chat_id, analyzer.analyze_text(&msg.text)))
            .await
        {
            Ok(result) => result.map(Ok),
            Err(busy) => {
                info!(user_id = busy.user_id, "meal request rejected: slot busy");
                Ok(Err(MealOutcome::Busy))
            }
        }
    }

    async fn persist(
        &self,
        msg: &IncomingText,
        edit_target: Option<Uuid>,
        analysis: &NutritionAnalysis,
    ) -> Result<MealOutcome, RepoError> {
        let raw = serde_json::to_value(analysis).unwrap_or(serde_json::Value::Null);
        let nutrition = analysis.to_nutrition();

        if let Some(meal_id) = edit_target {
            if !self.meals.update(meal_id, msg.user_id, &nutrition, raw).await? {
                return Ok(MealOutcome::MealNotFound);
            }
            info!(user_id = msg.user_id, %meal_id, kcal = nutrition.calories_kcal, "meal updated");
            return Ok(MealOutcome::Updated { meal_id });
        }

        if self.meals.exists_by_message(msg.chat_id, msg.message_id).await? {
            return Ok(MealOutcome::AlreadySaved);
        }
        let record = self
            .meals
            .create(NewMeal {
                user_id: msg.user_id,
                chat_id: msg.chat_id,
                message_id: msg.message_id,
                source: "text".to_string(),
                original_text: Some(msg.text.clone()),
                nutrition,
                raw_analysis: raw,
            })
            .await?;
        info!(user_id = msg.user_id, meal_id = %record.id, kcal = record.nutrition.calories_kcal, "meal saved");
        Ok(MealOutcome::Saved { meal_id: record.id })
    }

    async fn start_correction(&self, cb: &IncomingCallback, meal_id: Uuid) -> Result<MealOutcome, MealError> {
        let Some(meal) = self.meals.get(meal_id, cb.user_id).await? else {
            self.alert(cb, texts::MEAL_NOT_FOUND).await?;
            return Ok(MealOutcome::MealNotFound);
        };
        if older_than(&meal, self.gate.edit_window) {
            self.alert(cb, &texts::edit_window_expired(whole_hours(self.gate.edit_window)))
                .await?;
            return Ok(MealOutcome::WindowClosed);
        }

        // Controls ship with the prompt; after this only the session's end
        // rewrites it.
        let token = SessionToken::generate();
        let prompt = self
            .transport
            .send(meal.chat_id, texts::CORRECTION_PROMPT, Some(&correction_controls(&token)))
            .await?;
        self.sessions
            .start(cb.user_id, meal_id, token.clone(), prompt, self.gate.edit_timeout);
        self.transport.answer_callback(&cb.callback_id, None, false).await?;
        Ok(MealOutcome::CorrectionStarted { meal_id, token })
    }

    async fn handle_feedback(
        &self,
        cb: &IncomingCallback,
        token: &SessionToken,
        kind: ActionKind,
    ) -> Result<MealOutcome, MealError> {
        if kind == ActionKind::Delete {
            if let Some(outcome) = self.refuse_correction_delete(cb, token).await? {
                return Ok(outcome);
            }
        }

        let outcome = match self.sessions.act(cb.user_id, token, kind).await? {
            ActOutcome::Stale => {
                self.alert(cb, texts::CORRECTION_STALE).await?;
                return Ok(MealOutcome::Stale);
            }
            ActOutcome::Resolved { target_id } => MealOutcome::CorrectionKept { meal_id: target_id },
            ActOutcome::Deleted { target_id, found: true } => MealOutcome::Deleted { meal_id: target_id },
            ActOutcome::Deleted { found: false, .. } => MealOutcome::MealNotFound,
        };
        self.transport.answer_callback(&cb.callback_id, None, false).await?;
        Ok(outcome)
    }

    /// Stale token or a meal past the delete window. Either way nothing is
    /// touched; a closed window leaves the session open for keep or a
    /// correction text.
    async fn refuse_correction_delete(
        &self,
        cb: &IncomingCallback,
        token: &SessionToken,
    ) -> Result<Option<MealOutcome>, MealError> {
        let Some(target_id) = self.sessions.target_of(cb.user_id, token) else {
            self.alert(cb, texts::CORRECTION_STALE).await?;
            return Ok(Some(MealOutcome::Stale));
        };
        match self.meals.get(target_id, cb.user_id).await? {
            Some(meal) if older_than(&meal, self.gate.delete_window) => {
                self.alert(cb, &texts::delete_window_expired(whole_hours(self.gate.delete_window)))
                    .await?;
                Ok(Some(MealOutcome::WindowClosed))
            }
            _ => Ok(None),
        }
    }

    async fn delete_saved(&self, cb: &IncomingCallback, meal_id: Uuid) -> Result<MealOutcome, MealError> {
        let Some(meal) = self.meals.get(meal_id, cb.user_id).await? else {
            self.alert(cb, texts::MEAL_NOT_FOUND).await?;
            return Ok(MealOutcome::MealNotFound);
        };
        if older_than(&meal, self.gate.delete_window) {
            self.alert(cb, &texts::delete_window_expired(whole_hours(self.gate.delete_window)))
                .await?;
            return Ok(MealOutcome::WindowClosed);
        }
        if !self.meals.soft_delete(meal_id, cb.user_id).await? {
            self.alert(cb, texts::MEAL_NOT_FOUND).await?;
            return Ok(MealOutcome::MealNotFound);
        }
        info!(user_id = cb.user_id, %meal_id, "meal deleted");

        if let Some(message) = cb.message {
            self.edit_best_effort(message, texts::DELETED).await;
        }
        self.transport.answer_callback(&cb.callback_id, None, false).await?;
        Ok(MealOutcome::Deleted { meal_id })
    }

    /// Reply to a non-text message (sticker, voice, photo). Sessions are untouched.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the reply cannot be sent.
    pub async fn reject_unsupported(&self, chat_id: i64) -> Result<MealOutcome, MealError> {
        self.transport.send(chat_id, texts::PRECHECK_NOT_TEXT, None).await?;
        Ok(MealOutcome::Rejected(Rejection::NotFood))
    }

    /// Stop the client spinner for a button we do not handle.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the acknowledgement fails.
    pub async fn acknowledge(&self, callback_id: &str) -> Result<(), MealError> {
        self.transport.answer_callback(callback_id, None, false).await?;
        Ok(())
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn reply(&self, msg: &IncomingText, text: &str) -> Result<(), TransportError> {
        self.transport.send(msg.chat_id, text, None).await.map(|_| ())
    }

    async fn alert(&self, cb: &IncomingCallback, text: &str) -> Result<(), TransportError> {
        self.transport.answer_callback(&cb.callback_id, Some(text), true).await
    }

    /// Drive `work` while showing a typing indicator in `chat_id`, renewed
    /// every `TYPING_INTERVAL` until `work` completes.
    async fn with_typing<F: Future>(&self, chat_id: i64, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticks = tokio::time::interval(TYPING_INTERVAL);
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticks.tick() => {
                    if let Err(e) = self.transport.typing(chat_id).await {
                        debug!(chat_id, error = %e, "typing indicator failed");
                    }
                }
            }
        }
    }

    async fn edit_best_effort(&self, message: MessageRef, text: &str) {
        if let Err(e) = self.transport.edit(message, text, None).await {
            warn!(message_id = message.message_id, error = %e, "message edit failed");
        }
    }
}

fn older_than(meal: &MealRecord, window: Duration) -> bool {
    let window = time::Duration::try_from(window).unwrap_or(time::Duration::MAX);
    OffsetDateTime::now_utc() - meal.consumed_at > window
}

fn whole_hours(window: Duration) -> u64 {
    window.as_secs() / 3600
}

#[cfg(test)]
#[path = "meal_test.rs"]
mod tests;
