//! Storage seam for live correction sessions.
//!
//! The edit-session manager calls the store only while holding its registry
//! lock, so a process-local map needs no locking of its own. A shared store
//! must provide the same atomicity with a conditional write keyed on the
//! session token.

use std::collections::HashMap;

use super::edit_session::EditSession;
use crate::error::UserId;

pub trait SessionStore: Send {
    fn get(&self, user_id: UserId) -> Option<EditSession>;

    fn set(&mut self, user_id: UserId, session: EditSession);

    /// Remove and return the session for `user_id`, if any.
    fn clear(&mut self, user_id: UserId) -> Option<EditSession>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: HashMap<UserId, EditSession>,
}

impl SessionStore for MemorySessionStore {
    fn get(&self, user_id: UserId) -> Option<EditSession> {
        self.sessions.get(&user_id).cloned()
    }

    fn set(&mut self, user_id: UserId, session: EditSession) {
        self.sessions.insert(user_id, session);
    }

    fn clear(&mut self, user_id: UserId) -> Option<EditSession> {
        self.sessions.remove(&user_id)
    }
}
