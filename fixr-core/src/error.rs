use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booking::BookingStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Booking not found: {0}")]
    BookingNotFound(Uuid),

    #[error("Technician not found: {0}")]
    TechnicianNotFound(Uuid),

    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Service offering not found: {0}")]
    OfferingNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("Booking {0} was already accepted by another technician")]
    BookingAlreadyAssigned(Uuid),

    #[error("Booking {booking_id} is no longer pending (status {status})")]
    BookingNotPending {
        booking_id: Uuid,
        status: BookingStatus,
    },

    #[error("Insufficient coins: {required} required, {available} available")]
    InsufficientCoins {
        technician_id: Uuid,
        required: i64,
        available: i64,
    },

    #[error("No technicians available for this service")]
    NoTechniciansAvailable,

    #[error("Cancellation window expired at {deadline}")]
    CancellationWindowExpired { deadline: DateTime<Utc> },

    #[error("Booking can be auto-cancelled in {remaining_seconds}s")]
    CancellationWindowNotElapsed { remaining_seconds: i64 },

    #[error("Booking is {status}, expected {expected}")]
    BookingWrongState {
        status: BookingStatus,
        expected: BookingStatus,
    },

    #[error("OTP expired")]
    OtpExpired,

    #[error("OTP invalid")]
    OtpInvalid,

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Payment signature invalid")]
    SignatureInvalid,

    #[error("Payment order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BookingNotFound(_)
            | EngineError::TechnicianNotFound(_)
            | EngineError::PaymentNotFound(_)
            | EngineError::OfferingNotFound(_) => "NOT_FOUND",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::BookingAlreadyAssigned(_) => "BOOKING_ALREADY_ASSIGNED",
            EngineError::BookingNotPending { .. } => "BOOKING_NOT_PENDING",
            EngineError::InsufficientCoins { .. } => "INSUFFICIENT_COINS",
            EngineError::NoTechniciansAvailable => "NO_TECHNICIANS_AVAILABLE",
            EngineError::CancellationWindowExpired { .. } => "CANCELLATION_WINDOW_EXPIRED",
            EngineError::CancellationWindowNotElapsed { .. } => "CANCELLATION_WINDOW_NOT_ELAPSED",
            EngineError::BookingWrongState { .. } => "BOOKING_WRONG_STATE",
            EngineError::OtpExpired => "OTP_EXPIRED",
            EngineError::OtpInvalid => "OTP_INVALID",
            EngineError::ValidationError(_) => "VALIDATION_ERROR",
            EngineError::SignatureInvalid => "SIGNATURE_INVALID",
            EngineError::OrderCreationFailed(_) => "ORDER_CREATION_FAILED",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Races a caller should treat as a benign outcome rather than a failure.
    pub fn is_precondition_race(&self) -> bool {
        matches!(
            self,
            EngineError::BookingAlreadyAssigned(_) | EngineError::BookingNotPending { .. }
        )
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        EngineError::Storage(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
