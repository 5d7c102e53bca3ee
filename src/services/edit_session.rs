//! Edit sessions — per-user correction window with a background expiry timer.
//!
//! DESIGN
//! ======
//! A user has at most one live `EditSession`. Starting a new one supersedes
//! the old one; acting on it (keep / delete) or a timeout ends it. Every
//! session carries a fresh random `SessionToken`; buttons on the prompt echo
//! the token back, and anything that does not match the registered token is
//! stale.
//!
//! The registry (session store + per-user timer handles) lives behind one
//! `std::sync::Mutex`. Each transition is a single critical section with no
//! `.await` inside, so start, act, finalize and the timer's wake-up check
//! never interleave mid-mutation. Transport and repository calls happen
//! after the lock is dropped.
//!
//! CANCELLATION
//! ============
//! Ending a session aborts its timer task, but the timer does not rely on
//! that: on wake it re-reads the registry and proceeds only if its own token
//! is still the registered one. A timer that loses that race exits without
//! touching anything.
//!
//! ERROR HANDLING
//! ==============
//! Prompt rewrites (expired, replaced, kept, deleted) are cosmetic; failures
//! are logged and dropped. The registry change always happens first. Only
//! the soft delete in `act` can fail the call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session_store::{MemorySessionStore, SessionStore};
use crate::db::meals::{MealRepo, RepoError};
use crate::error::{ErrorCode, UserId};
use crate::texts;
use crate::transport::{MessageRef, Transport};

// =============================================================================
// TYPES
// =============================================================================

/// Opaque random value identifying exactly one session instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a random 32-char hex token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl From<&str> for SessionToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSession {
    /// Meal being corrected.
    pub target_id: Uuid,
    pub token: SessionToken,
    /// Message rewritten when the session ends.
    pub prompt: MessageRef,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Resolve,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActOutcome {
    /// No session, or the token belongs to a session that already ended.
    Stale,
    Resolved { target_id: Uuid },
    /// `found` is false when the meal was already gone or not owned.
    Deleted { target_id: Uuid, found: bool },
}

/// Why a session left the registry. Used for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Resolved,
    Deleted,
    TimedOut,
    Replaced,
    Finalized,
}

impl SessionEnd {
    fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Deleted => "deleted",
            Self::TimedOut => "timed_out",
            Self::Replaced => "replaced",
            Self::Finalized => "finalized",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EditSessionError {
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl ErrorCode for EditSessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Repo(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Repo(e) => e.retryable(),
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

struct TimerEntry {
    token: SessionToken,
    handle: AbortHandle,
}

struct Registry {
    store: Box<dyn SessionStore>,
    timers: HashMap<UserId, TimerEntry>,
}

impl Registry {
    /// Remove the session and abort its timer. Caller must not be the timer.
    fn take(&mut self, user_id: UserId) -> Option<EditSession> {
        if let Some(timer) = self.timers.remove(&user_id) {
            timer.handle.abort();
        }
        self.store.clear(user_id)
    }
}

struct Inner {
    registry: Mutex<Registry>,
    transport: Arc<dyn Transport>,
    meals: Arc<dyn MealRepo>,
}

#[derive(Clone)]
pub struct EditSessionManager {
    inner: Arc<Inner>,
}

impl EditSessionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, meals: Arc<dyn MealRepo>) -> Self {
        Self::with_store(Box::new(MemorySessionStore::default()), transport, meals)
    }

    #[must_use]
    pub fn with_store(store: Box<dyn SessionStore>, transport: Arc<dyn Transport>, meals: Arc<dyn MealRepo>) -> Self {
        let registry = Registry { store, timers: HashMap::new() };
        Self { inner: Arc::new(Inner { registry: Mutex::new(registry), transport, meals }) }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Open a correction session for `target_id` under `token`, superseding
    /// any live one.
    ///
    /// `prompt` should already carry the controls bound to `token`. The
    /// superseded prompt is rewritten in the background. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        &self,
        user_id: UserId,
        target_id: Uuid,
        token: SessionToken,
        prompt: MessageRef,
        timeout: Duration,
    ) {
        let deadline = Instant::now() + timeout;
        let session = EditSession { target_id, token: token.clone(), prompt, deadline };

        let previous = {
            let mut reg = self.registry();
            let previous = reg.take(user_id);
            reg.store.set(user_id, session);
            let timer = tokio::spawn(run_timeout(self.clone(), user_id, token.clone(), deadline));
            reg.timers
                .insert(user_id, TimerEntry { token, handle: timer.abort_handle() });
            previous
        };

        if let Some(old) = previous {
            log_end(user_id, &old, SessionEnd::Replaced);
            let transport = Arc::clone(&self.inner.transport);
            tokio::spawn(async move {
                rewrite_prompt(transport.as_ref(), user_id, old.prompt, texts::CORRECTION_REPLACED).await;
            });
        }

        info!(user_id, %target_id, timeout_secs = timeout.as_secs(), "edit session started");
    }

    /// Target of the live session if `token` is the registered one. Read-only.
    pub fn target_of(&self, user_id: UserId, token: &SessionToken) -> Option<Uuid> {
        self.registry()
            .store
            .get(user_id)
            .filter(|live| live.token == *token)
            .map(|live| live.target_id)
    }

    /// Resolve or delete through the session identified by `token`.
    ///
    /// A missing or mismatched token returns `Stale` without side effects.
    ///
    /// # Errors
    ///
    /// Returns a repository error if the soft delete fails. The session has
    /// already been closed by then.
    pub async fn act(
        &self,
        user_id: UserId,
        token: &SessionToken,
        kind: ActionKind,
    ) -> Result<ActOutcome, EditSessionError> {
        let session = {
            let mut reg = self.registry();
            match reg.store.get(user_id) {
                Some(live) if live.token == *token => reg.take(user_id),
                _ => None,
            }
        };
        let Some(session) = session else {
            debug!(user_id, "edit session action on stale token");
            return Ok(ActOutcome::Stale);
        };

        let target_id = session.target_id;
        match kind {
            ActionKind::Resolve => {
                log_end(user_id, &session, SessionEnd::Resolved);
                rewrite_prompt(self.inner.transport.as_ref(), user_id, session.prompt, texts::CORRECTION_KEPT).await;
                Ok(ActOutcome::Resolved { target_id })
            }
            ActionKind::Delete => {
                let found = self.inner.meals.soft_delete(target_id, user_id).await?;
                log_end(user_id, &session, SessionEnd::Deleted);
                let text = if found { texts::DELETED } else { texts::MEAL_NOT_FOUND };
                rewrite_prompt(self.inner.transport.as_ref(), user_id, session.prompt, text).await;
                Ok(ActOutcome::Deleted { target_id, found })
            }
        }
    }

    /// Close the live session without a token check. The prompt is left as is.
    pub fn finalize(&self, user_id: UserId) -> Option<EditSession> {
        let session = self.registry().take(user_id);
        if let Some(session) = &session {
            log_end(user_id, session, SessionEnd::Finalized);
        }
        session
    }

    #[cfg(test)]
    pub fn current(&self, user_id: UserId) -> Option<EditSession> {
        self.registry().store.get(user_id)
    }

    /// Timer wake-up: remove the session only if `token` is still registered.
    /// Does not abort the timer handle, since the caller is that timer.
    fn expire(&self, user_id: UserId, token: &SessionToken) -> Option<EditSession> {
        let mut reg = self.registry();
        match reg.store.get(user_id) {
            Some(live) if live.token == *token => {
                if reg.timers.get(&user_id).is_some_and(|t| t.token == *token) {
                    reg.timers.remove(&user_id);
                }
                reg.store.clear(user_id)
            }
            _ => None,
        }
    }
}

// =============================================================================
// TIMER
// =============================================================================

async fn run_timeout(manager: EditSessionManager, user_id: UserId, token: SessionToken, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;

    let Some(session) = manager.expire(user_id, &token) else {
        debug!(user_id, "edit session timer woke after session ended");
        return;
    };
    log_end(user_id, &session, SessionEnd::TimedOut);
    rewrite_prompt(manager.inner.transport.as_ref(), user_id, session.prompt, texts::CORRECTION_EXPIRED).await;
}

async fn rewrite_prompt(transport: &dyn Transport, user_id: UserId, prompt: MessageRef, text: &str) {
    if let Err(e) = transport.edit(prompt, text, None).await {
        warn!(user_id, message_id = prompt.message_id, error = %e, "edit session prompt rewrite failed");
    }
}

fn log_end(user_id: UserId, session: &EditSession, end: SessionEnd) {
    info!(user_id, target_id = %session.target_id, end = end.as_str(), "edit session ended");
}

#[cfg(test)]
#[path = "edit_session_test.rs"]
mod tests;
