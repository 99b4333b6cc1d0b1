use axum::{
    extract::{Extension, Json, State},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fixr_core::repository::TechnicianRepository;
use fixr_core::{CoinUsage, EngineError};

use crate::error::AppError;
use crate::middleware::{Claims, Role};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct TopUpRequest {
    amount: i64,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
    technician_id: Uuid,
    balance: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    history: Vec<CoinUsage>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/technicians/me/coins", get(balance).post(top_up))
}

async fn balance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<BalanceResponse>, AppError> {
    claims.require(&[Role::Technician])?;
    let store = state.engine.store();
    let technician = store
        .get_technician(claims.sub)
        .await?
        .ok_or(EngineError::TechnicianNotFound(claims.sub))?;
    let history = store.coin_usages(claims.sub).await?;

    Ok(Json(BalanceResponse { technician_id: claims.sub, balance: technician.coins, history }))
}

async fn top_up(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TopUpRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    claims.require(&[Role::Technician])?;
    let (balance, _) = state.engine.top_up(claims.sub, req.amount).await?;
    Ok(Json(BalanceResponse { technician_id: claims.sub, balance, history: Vec::new() }))
}
