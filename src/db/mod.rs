//! Database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup uses this module to create the shared SQLx pool and enforce schema
//! migrations before the webhook starts accepting updates. Without a
//! `DATABASE_URL` the service falls back to `meals::MemoryMealRepo`.

pub mod meals;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::env_parse;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS))
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}
