mod concurrency;
mod config;
mod db;
mod error;
mod llm;
mod rate_limit;
mod routes;
mod services;
mod state;
mod texts;
mod transport;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};
use crate::db::meals::{MealRepo, MemoryMealRepo, PgMealRepo};
use crate::services::meal::MealService;
use crate::services::nutrition::{LlmNutritionAnalyzer, NutritionAnalyzer};
use crate::transport::{TelegramTransport, Transport};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env().expect("invalid configuration");
    init_tracing(&config);

    let meals: Arc<dyn MealRepo> = match &config.database_url {
        Some(url) => {
            let pool = db::init_pool(url).await.expect("database init failed");
            Arc::new(PgMealRepo::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, meals are kept in memory only");
            Arc::new(MemoryMealRepo::new())
        }
    };

    let transport: Arc<dyn Transport> = Arc::new(
        TelegramTransport::new(&config.telegram_api_base, &config.bot_token).expect("transport init failed"),
    );

    // Non-fatal: without a provider every meal is answered as unrecognized.
    let analyzer: Option<Arc<dyn NutritionAnalyzer>> = match llm::from_env() {
        Ok(handle) => {
            tracing::info!(model = %handle.model, "LLM client initialized");
            Some(Arc::new(LlmNutritionAnalyzer::new(handle.chat, handle.max_tokens)))
        }
        Err(e) => {
            tracing::warn!(error = %e, "LLM client not configured, nutrition analysis disabled");
            None
        }
    };

    let service = MealService::new(config.gate, meals, transport, analyzer);
    let app = routes::app(state::AppState::new(service, &config.webhook_secret));

    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "mealgate listening");
    axum::serve(listener, app).await.expect("server failed");
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
