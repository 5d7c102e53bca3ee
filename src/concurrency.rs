//! Per-user admission guard for in-flight inference calls.
//!
//! DESIGN
//! ======
//! A non-blocking test-and-set over `HashMap<UserId, usize>`: `acquire`
//! either takes a slot immediately or reports the user as busy. The scoped
//! form hands out a `SlotGuard` whose `Drop` releases the slot, so success,
//! early return, error and task cancellation all give the slot back.
//!
//! Holder counts generalize to "at most N"; the service runs with N = 1.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::UserId;

/// Returned instead of running the protected operation when the user already
/// has the maximum number of calls in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("user {user_id} already has a request in flight")]
pub struct Busy {
    pub user_id: UserId,
}

#[derive(Clone)]
pub struct ConcurrencyGuard {
    inner: Arc<Mutex<HashMap<UserId, usize>>>,
    max_per_user: usize,
}

impl ConcurrencyGuard {
    /// `max_per_user` is clamped to at least one holder.
    #[must_use]
    pub fn new(max_per_user: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), max_per_user: max_per_user.max(1) }
    }

    /// Try to take a slot for `user_id`. Never waits.
    #[must_use]
    pub fn acquire(&self, user_id: UserId) -> bool {
        let mut held = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = held.entry(user_id).or_insert(0);
        if *count >= self.max_per_user {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back one slot. Releasing a user with no slot is a no-op.
    pub fn release(&self, user_id: UserId) {
        let mut held = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(count) = held.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                held.remove(&user_id);
            }
        }
    }

    /// Scoped acquisition: the slot is released when the guard drops.
    #[must_use]
    pub fn try_slot(&self, user_id: UserId) -> Option<SlotGuard> {
        self.acquire(user_id)
            .then(|| SlotGuard { guard: self.clone(), user_id })
    }

    /// Run `f` while holding a slot for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Busy`] without calling `f` if no slot is free.
    pub async fn with_slot<F, Fut, T>(&self, user_id: UserId, f: F) -> Result<T, Busy>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_slot) = self.try_slot(user_id) else {
            debug!(user_id, "concurrency guard: busy");
            return Err(Busy { user_id });
        };
        Ok(f().await)
    }

    /// Number of slots currently held by `user_id`.
    #[cfg(test)]
    #[must_use]
    pub fn in_flight(&self, user_id: UserId) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A held slot. Dropping it releases the slot.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard {
    guard: ConcurrencyGuard,
    user_id: UserId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.guard.release(self.user_id);
    }
}

#[cfg(test)]
#[path = "concurrency_test.rs"]
mod tests;
