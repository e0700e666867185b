use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::events::worker_pool::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_CAPACITY};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_EVENT_SUBJECT: &str = "payment.service.event.>";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Upper bound on pooled connections shared process-wide
    #[validate(range(min = 1, max = 1000))]
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Maximum lifetime of a pooled connection in seconds
    #[serde(default = "default_db_max_lifetime_secs")]
    pub db_max_lifetime_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Number of event workers
    #[validate(range(min = 1, max = 512))]
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Capacity of the task queue feeding the workers
    #[validate(range(min = 1))]
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,

    /// Attempts made by retrying transactions before giving up
    #[validate(range(min = 1, max = 20))]
    #[serde(default = "default_tx_max_attempts")]
    pub tx_max_attempts: u32,

    /// Linear backoff unit between transaction attempts, in milliseconds
    #[serde(default = "default_tx_backoff_ms")]
    pub tx_backoff_ms: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_cart_ttl_days")]
    pub cart_ttl_days: i64,

    /// How long a processing order may still be cancelled
    #[validate(range(min = 0))]
    #[serde(default = "default_cancel_window_hours")]
    pub cancel_window_hours: i64,

    /// Redis connection URL; the in-memory cache is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Bus subject pattern carrying payment lifecycle events
    #[validate(length(min = 1))]
    #[serde(default = "default_event_subject")]
    pub event_subject: String,

    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_max_lifetime_secs() -> u64 {
    300
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_worker_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_task_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_tx_max_attempts() -> u32 {
    3
}

fn default_tx_backoff_ms() -> u64 {
    100
}

fn default_cart_ttl_days() -> i64 {
    7
}

fn default_cancel_window_hours() -> i64 {
    24
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_event_subject() -> String {
    DEFAULT_EVENT_SUBJECT.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

impl AppConfig {
    /// Builds a configuration with defaults for everything except the database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            db_max_connections: default_db_max_connections(),
            db_max_lifetime_secs: default_db_max_lifetime_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            worker_pool_size: default_worker_pool_size(),
            task_queue_capacity: default_task_queue_capacity(),
            tx_max_attempts: default_tx_max_attempts(),
            tx_backoff_ms: default_tx_backoff_ms(),
            cart_ttl_days: default_cart_ttl_days(),
            cancel_window_hours: default_cancel_window_hours(),
            redis_url: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            event_subject: default_event_subject(),
            log_level: default_log_level(),
            log_json: false,
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn tx_backoff(&self) -> Duration {
        Duration::from_millis(self.tx_backoff_ms)
    }

    pub fn cart_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.cart_ttl_days)
    }

    pub fn cancel_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cancel_window_hours)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stateset_commerce={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://stateset_commerce.db?mode=rwc")?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}
