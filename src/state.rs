//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. The
//! meal service owns the rate limiter, concurrency guard and edit-session
//! registry; cloning the state shares them.

use std::sync::Arc;

use crate::services::meal::MealService;

#[derive(Clone)]
pub struct AppState {
    pub meals: MealService,
    /// Path segment the chat platform must present on every webhook call.
    pub webhook_secret: Arc<str>,
}

impl AppState {
    #[must_use]
    pub fn new(meals: MealService, webhook_secret: &str) -> Self {
        Self { meals, webhook_secret: Arc::from(webhook_secret) }
    }
}
