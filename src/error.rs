//! Shared error conventions.
//!
//! Every layer owns its own `thiserror` enum; this module only carries the
//! trait that maps each of them onto a grepable code for logs and HTTP
//! responses.

/// Telegram user identifier. Every per-user map in the crate is keyed by it.
pub type UserId = i64;

/// Grepable error code and retryable flag for structured logging.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
