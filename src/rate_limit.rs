//! In-memory rate limiting for inference requests.
//!
//! DESIGN
//! ======
//! Rolling-window counters backed by `HashMap<UserId, VecDeque<Instant>>`.
//! Each user's window is pruned lazily on every `check`; a rejected check
//! records nothing, so a throttled user does not push their own window
//! further out. At most once per window, a `check` also sweeps every user
//! and drops windows that pruned to empty, so idle users do not accumulate.
//!
//! TRADE-OFFS
//! ==========
//! State is process-local. A multi-instance deployment needs a shared store
//! with the same prune-then-count semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::GateConfig;
use crate::error::UserId;

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Default)]
struct Windows {
    by_user: HashMap<UserId, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Windows>>,
    quota: usize,
    window: Duration,
}

impl RateLimiter {
    /// Allow `quota` admissions per user within any trailing `window`.
    #[must_use]
    pub fn new(quota: usize, window: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(Windows::default())), quota, window }
    }

    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(config.rate_limit_quota, config.rate_limit_window)
    }

    /// Admit and record a request for `user_id`, or reject it without
    /// recording anything.
    #[must_use]
    pub fn check(&self, user_id: UserId) -> bool {
        self.check_at(user_id, Instant::now())
    }

    /// Internal: check + record with explicit timestamp (for testing).
    pub(crate) fn check_at(&self, user_id: UserId, now: Instant) -> bool {
        let mut windows = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if windows
            .last_sweep
            .is_none_or(|at| now.saturating_duration_since(at) >= self.window)
        {
            windows.by_user.retain(|_, deque| {
                prune_window(deque, now, self.window);
                !deque.is_empty()
            });
            windows.last_sweep = Some(now);
        }

        let window = windows.by_user.entry(user_id).or_default();
        prune_window(window, now, self.window);
        if window.len() >= self.quota {
            if window.is_empty() {
                windows.by_user.remove(&user_id);
            }
            debug!(user_id, quota = self.quota, "rate limit: rejected");
            return false;
        }

        window.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_user
            .len()
    }

    /// Admissions still available to `user_id` right now.
    #[cfg(test)]
    #[must_use]
    pub fn remaining(&self, user_id: UserId) -> usize {
        self.remaining_at(user_id, Instant::now())
    }

    #[cfg(test)]
    pub(crate) fn remaining_at(&self, user_id: UserId, now: Instant) -> usize {
        let mut windows = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(window) = windows.by_user.get_mut(&user_id) else {
            return self.quota;
        };
        prune_window(window, now, self.window);
        self.quota.saturating_sub(window.len())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Drop timestamps that are a full window old or older.
fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = deque.front() {
        if now.saturating_duration_since(front) >= window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
