use axum::{
    extract::{Extension, Json, Path, State},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fixr_core::repository::RejectedBy;
use fixr_core::{Booking, BookingStatus, EngineError, GeoPoint, OtpPurpose, TimeSlot};
use fixr_dispatch::CreateBooking;

use crate::error::AppError;
use crate::middleware::{Claims, Role};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct PrecheckRequest {
    sub_category_id: Uuid,
    date: NaiveDate,
    time_slot: TimeSlot,
    location: Option<GeoPoint>,
}

#[derive(Debug, Serialize)]
struct PrecheckResponse {
    candidates: usize,
}

#[derive(Debug, Serialize)]
struct BookingCreated {
    booking_id: Uuid,
    status: BookingStatus,
}

#[derive(Debug, Serialize)]
struct BroadcastResponse {
    booking_id: Uuid,
    candidates: usize,
}

#[derive(Debug, Serialize)]
struct AcceptResponse {
    booking_id: Uuid,
    status: BookingStatus,
    balance: i64,
}

#[derive(Debug, Serialize)]
struct RefundResponse {
    booking_id: Uuid,
    status: BookingStatus,
    refund_id: Uuid,
}

#[derive(Debug, Serialize)]
struct AutoCancelResponse {
    booking_id: Uuid,
    cancelled: bool,
    status: BookingStatus,
    refund_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct RejectResponse {
    booking_id: Uuid,
    refund_id: Uuid,
    reversed_coins: i64,
}

#[derive(Debug, Serialize)]
struct OtpIssued {
    booking_id: Uuid,
    purpose: OtpPurpose,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct VerifyOtpRequest {
    code: String,
}

#[derive(Debug, Serialize)]
struct OtpVerified {
    booking_id: Uuid,
    status: BookingStatus,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings/precheck", post(precheck))
        .route("/v1/bookings", post(create_booking))
        .route("/v1/bookings/{id}", get(get_booking))
        .route("/v1/bookings/{id}/broadcast", post(broadcast))
        .route("/v1/bookings/{id}/accept", post(accept))
        .route("/v1/bookings/{id}/cancel", post(cancel))
        .route("/v1/bookings/{id}/auto-cancel", post(auto_cancel))
        .route("/v1/bookings/{id}/reject", post(reject))
        .route("/v1/bookings/{id}/otp/{purpose}", post(generate_otp))
        .route("/v1/bookings/{id}/otp/{purpose}/verify", post(verify_otp))
}

async fn precheck(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<PrecheckRequest>,
) -> Result<Json<PrecheckResponse>, AppError> {
    claims.require(&[Role::Customer])?;
    let candidates = state
        .engine
        .precheck(req.sub_category_id, req.date, req.time_slot, req.location)
        .await?;
    Ok(Json(PrecheckResponse { candidates }))
}

async fn create_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateBooking>,
) -> Result<Json<BookingCreated>, AppError> {
    claims.require(&[Role::Customer])?;
    let booking = state.engine.create_booking(claims.sub, req).await?;
    Ok(Json(BookingCreated { booking_id: booking.id, status: booking.status }))
}

async fn get_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    let booking = state.engine.get_booking(id, claims.actor()).await?;
    Ok(Json(booking))
}

async fn broadcast(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<BroadcastResponse>, AppError> {
    claims.require(&[Role::Customer, Role::Admin])?;
    // Customers may only re-dispatch their own bookings
    state.engine.get_booking(id, claims.actor()).await?;
    let candidates = state.engine.broadcast(id).await?;
    Ok(Json(BroadcastResponse { booking_id: id, candidates }))
}

async fn accept(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<AcceptResponse>, AppError> {
    claims.require(&[Role::Technician])?;
    let acceptance = state.engine.accept(id, claims.sub).await?;
    Ok(Json(AcceptResponse {
        booking_id: id,
        status: acceptance.booking.status,
        balance: acceptance.balance,
    }))
}

async fn cancel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<RefundResponse>, AppError> {
    claims.require(&[Role::Customer])?;
    let refund = state.engine.cancel_booking(id, claims.sub).await?;
    Ok(Json(RefundResponse {
        booking_id: id,
        status: BookingStatus::Cancelled,
        refund_id: refund.id,
    }))
}

/// Any authenticated caller may trigger this; the engine decides whether the
/// window has elapsed.
async fn auto_cancel(
    State(state): State<AppState>,
    Extension(_claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<AutoCancelResponse>, AppError> {
    match state.engine.auto_cancel(id).await {
        Ok((booking, refund)) => Ok(Json(AutoCancelResponse {
            booking_id: id,
            cancelled: true,
            status: booking.status,
            refund_id: Some(refund.id),
        })),
        // Already accepted or closed by someone else
        Err(EngineError::BookingNotPending { status, .. }) => Ok(Json(AutoCancelResponse {
            booking_id: id,
            cancelled: false,
            status,
            refund_id: None,
        })),
        Err(e) => Err(e.into()),
    }
}

async fn reject(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<RejectResponse>, AppError> {
    let by = match claims.role {
        Role::Technician => RejectedBy::Technician(claims.sub),
        Role::Admin => RejectedBy::Admin,
        Role::Customer => {
            return Err(AppError::AuthorizationError("customers cancel, they do not reject".into()))
        }
    };

    let rejection = state.engine.reject_booking(id, by).await?;
    Ok(Json(RejectResponse {
        booking_id: id,
        refund_id: rejection.refund.id,
        reversed_coins: rejection.reversal.map(|u| u.amount).unwrap_or(0),
    }))
}

async fn generate_otp(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, purpose)): Path<(Uuid, OtpPurpose)>,
) -> Result<Json<OtpIssued>, AppError> {
    claims.require(&[Role::Technician])?;
    let expires_at = state.engine.generate_otp(id, purpose, claims.sub).await?;
    Ok(Json(OtpIssued { booking_id: id, purpose, expires_at }))
}

async fn verify_otp(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((id, purpose)): Path<(Uuid, OtpPurpose)>,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<Json<OtpVerified>, AppError> {
    claims.require(&[Role::Customer])?;
    if req.code.trim().len() != fixr_core::otp::OTP_DIGITS {
        return Err(AppError::ValidationError("code must be 6 digits".into()));
    }
    let booking = state.engine.verify_otp(id, purpose, &req.code, claims.actor()).await?;
    Ok(Json(OtpVerified { booking_id: id, status: booking.status }))
}
