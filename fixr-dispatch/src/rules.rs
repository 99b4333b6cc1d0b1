use chrono::Duration;

/// Tunables the engine reads on every operation.
#[derive(Debug, Clone)]
pub struct EngineRules {
    pub cancellation_window: Duration,
    pub auto_cancel_window: Duration,
    pub otp_ttl: Duration,
    pub service_radius_km: f64,
    pub failed_operation_max_retries: i32,
    pub currency: String,
}

impl Default for EngineRules {
    fn default() -> Self {
        Self {
            cancellation_window: Duration::minutes(10),
            auto_cancel_window: Duration::minutes(10),
            otp_ttl: Duration::minutes(2),
            service_radius_km: 15.0,
            failed_operation_max_retries: 5,
            currency: "INR".to_string(),
        }
    }
}
