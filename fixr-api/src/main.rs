use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fixr_api::{app, state::{AppState, AuthConfig}, worker};
use fixr_core::SystemClock;
use fixr_dispatch::{BookingEngine, EngineRules, LoggingOtpDelivery, SandboxGateway};
use fixr_store::{Config, EventBus, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fixr_api=debug,fixr_dispatch=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Fixr API on port {}", config.server.port);

    let store = fixr_store::connect(&config.storage).await.context("Failed to open store")?;

    let redis = match config.redis.url.as_deref() {
        Some(url) => Some(Arc::new(RedisClient::new(url).context("Failed to connect to Redis")?)),
        None => {
            tracing::warn!("No Redis configured, rate limiting disabled");
            None
        }
    };

    let events = EventBus::new();
    let rules = &config.business_rules;
    let engine = BookingEngine::new(
        store,
        Arc::new(events.clone()),
        Arc::new(SystemClock),
        Arc::new(SandboxGateway::new(&config.payment.key_id, &config.payment.key_secret)),
        Arc::new(LoggingOtpDelivery),
        EngineRules {
            cancellation_window: chrono::Duration::seconds(rules.cancellation_window_seconds),
            auto_cancel_window: chrono::Duration::seconds(rules.auto_cancel_window_seconds),
            otp_ttl: chrono::Duration::seconds(rules.otp_ttl_seconds),
            service_radius_km: rules.service_radius_km,
            failed_operation_max_retries: rules.failed_operation_max_retries,
            currency: config.payment.currency.clone(),
        },
    );

    tokio::spawn(worker::start_watchdog(
        engine.clone(),
        Duration::from_secs(rules.watchdog_interval_seconds),
    ));
    tokio::spawn(worker::start_retry_worker(
        engine.clone(),
        Duration::from_secs(rules.failed_operation_retry_seconds),
    ));

    let app_state = AppState {
        engine,
        events,
        redis,
        requests_per_minute: config.redis.requests_per_minute,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
            dev_tokens: config.auth.dev_tokens,
        },
        payment_key_id: config.payment.key_id.clone(),
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
