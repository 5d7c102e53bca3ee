//! Domain services.
//!
//! `edit_session` is the correction-window state machine; `meal` composes it
//! with the rate limiter, concurrency guard and collaborators into the bot's
//! flows. `precheck` and `nutrition` are the stages of a single analysis.

pub mod edit_session;
pub mod meal;
pub mod nutrition;
pub mod precheck;
pub mod session_store;
