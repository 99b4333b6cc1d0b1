use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fixr_core::EngineError;
use serde_json::json;

pub const TOP_UP_URL: &str = "/v1/technicians/me/coins";

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    Engine(EngineError),
    InternalServerError(String),
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::BookingNotFound(_)
        | EngineError::TechnicianNotFound(_)
        | EngineError::PaymentNotFound(_)
        | EngineError::OfferingNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidTransition { .. }
        | EngineError::BookingAlreadyAssigned(_)
        | EngineError::BookingNotPending { .. }
        | EngineError::CancellationWindowExpired { .. }
        | EngineError::CancellationWindowNotElapsed { .. }
        | EngineError::BookingWrongState { .. } => StatusCode::CONFLICT,
        EngineError::InsufficientCoins { .. } => StatusCode::PAYMENT_REQUIRED,
        EngineError::NoTechniciansAvailable => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::OtpExpired => StatusCode::GONE,
        EngineError::OtpInvalid | EngineError::SignatureInvalid => StatusCode::BAD_REQUEST,
        EngineError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::OrderCreationFailed(_) => StatusCode::BAD_GATEWAY,
        EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "Internal Server Error" }))
            }
            AppError::Engine(EngineError::Storage(msg)) => {
                tracing::error!("Storage failure: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal Server Error", "code": "STORAGE_ERROR" }),
                )
            }
            AppError::Engine(err) => {
                let status = engine_status(&err);
                let mut body = json!({ "error": err.to_string(), "code": err.code() });
                match &err {
                    EngineError::InsufficientCoins { required, available, .. } => {
                        body["required"] = json!(required);
                        body["available"] = json!(available);
                        body["top_up_url"] = json!(TOP_UP_URL);
                    }
                    EngineError::CancellationWindowNotElapsed { remaining_seconds } => {
                        body["remaining_seconds"] = json!(remaining_seconds);
                    }
                    _ => {}
                }
                (status, body)
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err)
    }
}
