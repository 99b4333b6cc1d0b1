use axum::{
    extract::{Extension, Json, State},
    routing::post,
    Router,
};
use serde::Serialize;
use uuid::Uuid;

use fixr_dispatch::{CreateOrder, VerifyPayment};

use crate::error::AppError;
use crate::middleware::{Claims, Role};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct OrderResponse {
    payment_id: Uuid,
    gateway_order_id: String,
    amount: i64,
    currency: String,
    key_id: String,
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    authorized: bool,
    booking_id: Uuid,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments/orders", post(create_order))
        .route("/v1/payments/verify", post(verify_payment))
}

async fn create_order(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateOrder>,
) -> Result<Json<OrderResponse>, AppError> {
    claims.require(&[Role::Customer])?;
    let order = state.engine.create_payment_order(claims.sub, req).await?;

    Ok(Json(OrderResponse {
        payment_id: order.payment_id,
        gateway_order_id: order.gateway_order_id,
        amount: order.amount,
        currency: order.currency,
        key_id: state.payment_key_id.clone(),
    }))
}

async fn verify_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<VerifyPayment>,
) -> Result<Json<VerifyResponse>, AppError> {
    claims.require(&[Role::Customer])?;
    let booking = state.engine.verify_payment(claims.sub, req).await?;
    Ok(Json(VerifyResponse { authorized: true, booking_id: booking.id }))
}
