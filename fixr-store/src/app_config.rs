use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::env;

use crate::error::StoreError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub payment: PaymentConfig,
    pub business_rules: BusinessRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Rate limiting is skipped when unset
    pub url: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub requests_per_minute: u64,
}

fn default_rate_limit() -> u64 { 120 }

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiration_seconds: u64,
    /// Exposes the token-minting endpoint. Local development only.
    #[serde(default)]
    pub dev_tokens: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentConfig {
    pub key_id: String,
    pub key_secret: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String { "INR".into() }

#[derive(Debug, Deserialize, Clone)]
pub struct BusinessRules {
    pub cancellation_window_seconds: i64,
    pub auto_cancel_window_seconds: i64,
    pub otp_ttl_seconds: i64,
    pub service_radius_km: f64,
    pub watchdog_interval_seconds: u64,
    pub failed_operation_retry_seconds: u64,
    pub failed_operation_max_retries: i32,
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self {
            cancellation_window_seconds: 600,
            auto_cancel_window_seconds: 600,
            otp_ttl_seconds: 120,
            service_radius_km: 15.0,
            watchdog_interval_seconds: 30,
            failed_operation_retry_seconds: 60,
            failed_operation_max_retries: 5,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, StoreError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `FIXR__STORAGE__BACKEND=postgres`
            .add_source(config::Environment::with_prefix("FIXR").prefix_separator("__").separator("__"));

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, StoreError> {
        Ok(builder.build()?.try_deserialize()?)
    }
}
