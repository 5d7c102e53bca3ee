//! Process configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Required values fail startup with a `ConfigError`; everything else falls
//! back to a default through `env_parse`. LLM settings live in
//! `llm::config` because the service can boot without them.

use std::time::Duration;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_RATE_LIMIT_PER_MINUTE: usize = 6;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENT_PER_USER: usize = 1;
const DEFAULT_EDIT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_EDIT_WINDOW_HOURS: u64 = 48;
const DEFAULT_DELETE_WINDOW_HOURS: u64 = 48;
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const MIN_WEBHOOK_SECRET_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl crate::error::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "E_CONFIG_MISSING",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Limits shared by the rate limiter, concurrency guard and edit sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Admissions allowed per rolling window.
    pub rate_limit_quota: usize,
    pub rate_limit_window: Duration,
    /// In-flight inference calls allowed per user.
    pub max_concurrent_per_user: usize,
    /// How long a correction session stays open.
    pub edit_timeout: Duration,
    /// Meals older than this can no longer be corrected.
    pub edit_window: Duration,
    /// Meals older than this can no longer be deleted.
    pub delete_window: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rate_limit_quota: DEFAULT_RATE_LIMIT_PER_MINUTE,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            max_concurrent_per_user: DEFAULT_MAX_CONCURRENT_PER_USER,
            edit_timeout: Duration::from_secs(DEFAULT_EDIT_TIMEOUT_SECS),
            edit_window: hours(DEFAULT_EDIT_WINDOW_HOURS),
            delete_window: hours(DEFAULT_DELETE_WINDOW_HOURS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub webhook_secret: String,
    /// `None` runs against the in-memory meal repository.
    pub database_url: Option<String>,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub telegram_api_base: String,
    pub gate: GateConfig,
}

impl Config {
    /// Build the process config from environment variables.
    ///
    /// Required:
    /// - `BOT_TOKEN`
    /// - `WEBHOOK_SECRET` (at least 8 characters)
    ///
    /// Optional:
    /// - `DATABASE_URL`, `PORT` (8000), `LOG_LEVEL` (info), `LOG_FORMAT` (text|json)
    /// - `RATE_LIMIT_PER_MINUTE` (6), `RATE_LIMIT_WINDOW_SECS` (60)
    /// - `MAX_CONCURRENT_PER_USER` (1)
    /// - `EDIT_TIMEOUT_SECS` (300), `EDIT_WINDOW_HOURS` (48), `DELETE_WINDOW_HOURS` (48)
    /// - `TELEGRAM_API_BASE`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a required variable is missing or a value
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = required("BOT_TOKEN")?;
        let webhook_secret = required("WEBHOOK_SECRET")?;
        if webhook_secret.len() < MIN_WEBHOOK_SECRET_LEN {
            return Err(ConfigError::Invalid {
                var: "WEBHOOK_SECRET",
                reason: format!("must be at least {MIN_WEBHOOK_SECRET_LEN} characters"),
            });
        }

        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        let log_format = parse_log_format(std::env::var("LOG_FORMAT").ok().as_deref())?;
        let telegram_api_base = std::env::var("TELEGRAM_API_BASE")
            .unwrap_or_else(|_| DEFAULT_TELEGRAM_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let gate = GateConfig {
            rate_limit_quota: env_parse("RATE_LIMIT_PER_MINUTE", DEFAULT_RATE_LIMIT_PER_MINUTE),
            rate_limit_window: Duration::from_secs(env_parse(
                "RATE_LIMIT_WINDOW_SECS",
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )),
            max_concurrent_per_user: env_parse("MAX_CONCURRENT_PER_USER", DEFAULT_MAX_CONCURRENT_PER_USER),
            edit_timeout: Duration::from_secs(env_parse("EDIT_TIMEOUT_SECS", DEFAULT_EDIT_TIMEOUT_SECS)),
            edit_window: hours(env_parse("EDIT_WINDOW_HOURS", DEFAULT_EDIT_WINDOW_HOURS)),
            delete_window: hours(env_parse("DELETE_WINDOW_HOURS", DEFAULT_DELETE_WINDOW_HOURS)),
        };
        validate_gate(&gate)?;

        Ok(Self {
            bot_token,
            webhook_secret,
            database_url,
            port: env_parse("PORT", DEFAULT_PORT),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            log_format,
            telegram_api_base,
            gate,
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn parse_log_format(raw: Option<&str>) -> Result<LogFormat, ConfigError> {
    match raw.unwrap_or("text") {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(ConfigError::Invalid { var: "LOG_FORMAT", reason: format!("unknown format '{other}'") }),
    }
}

fn validate_gate(gate: &GateConfig) -> Result<(), ConfigError> {
    if gate.rate_limit_quota == 0 {
        return Err(ConfigError::Invalid { var: "RATE_LIMIT_PER_MINUTE", reason: "must be positive".into() });
    }
    if gate.rate_limit_window.is_zero() {
        return Err(ConfigError::Invalid { var: "RATE_LIMIT_WINDOW_SECS", reason: "must be positive".into() });
    }
    if gate.max_concurrent_per_user == 0 {
        return Err(ConfigError::Invalid { var: "MAX_CONCURRENT_PER_USER", reason: "must be at least 1".into() });
    }
    if gate.edit_timeout.is_zero() {
        return Err(ConfigError::Invalid { var: "EDIT_TIMEOUT_SECS", reason: "must be positive".into() });
    }
    Ok(())
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
