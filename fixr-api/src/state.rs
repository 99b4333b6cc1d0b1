use std::sync::Arc;

use fixr_dispatch::BookingEngine;
use fixr_store::{EventBus, RedisClient};

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub expiration: u64,
    pub dev_tokens: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: BookingEngine,
    pub events: EventBus,
    /// Rate limiting is skipped without Redis
    pub redis: Option<Arc<RedisClient>>,
    pub requests_per_minute: u64,
    pub auth: AuthConfig,
    /// Public key id handed to clients for gateway checkout
    pub payment_key_id: String,
}
