use std::time::Duration;

use tracing::{error, info};

use fixr_dispatch::BookingEngine;

const SWEEP_BATCH: i64 = 100;
const RETRY_BATCH: i64 = 50;

/// Auto-cancels bookings that sat unaccepted past the window. Requests that
/// never reach the auto-cancel endpoint are still refunded.
pub async fn start_watchdog(engine: BookingEngine, every: Duration) {
    info!("Watchdog started, sweeping every {:?}", every);
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;
        if let Err(e) = engine.sweep_expired(SWEEP_BATCH).await {
            error!("Watchdog sweep failed: {}", e);
        }
    }
}

pub async fn start_retry_worker(engine: BookingEngine, every: Duration) {
    info!("Failed operation worker started, polling every {:?}", every);
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;
        match engine.retry_failed_operations(RETRY_BATCH).await {
            Ok(report) if report != Default::default() => info!("Retried failed operations: {:?}", report),
            Ok(_) => {}
            Err(e) => error!("Retry sweep failed: {}", e),
        }
    }
}
