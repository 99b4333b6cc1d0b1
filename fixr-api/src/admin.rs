use axum::{
    extract::{Extension, Json, Path, State},
    http::StatusCode,
    routing::put,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use fixr_core::repository::{CatalogRepository, TechnicianRepository};
use fixr_core::{GeoPoint, ServiceOffering, Technician};

use crate::error::AppError;
use crate::middleware::{Claims, Role};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct OfferingRequest {
    name: String,
    price: i64,
    coin_cost: i64,
}

#[derive(Debug, Deserialize)]
struct TechnicianRequest {
    name: String,
    sub_category_ids: Vec<Uuid>,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default = "default_true")]
    approved: bool,
    location: Option<GeoPoint>,
}

fn default_true() -> bool {
    true
}

/// Sync endpoints used by the catalog and onboarding services.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/offerings/{id}", put(upsert_offering))
        .route("/v1/admin/technicians/{id}", put(upsert_technician))
}

async fn upsert_offering(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<OfferingRequest>,
) -> Result<StatusCode, AppError> {
    claims.require(&[Role::Admin])?;
    if req.price <= 0 || req.coin_cost < 0 {
        return Err(AppError::ValidationError("price must be positive and coin cost non-negative".into()));
    }

    let offering = ServiceOffering { id, name: req.name, price: req.price, coin_cost: req.coin_cost };
    state.engine.store().upsert_offering(&offering).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Profile fields only. The store keeps the coin balance and join date of an
/// existing technician.
async fn upsert_technician(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<TechnicianRequest>,
) -> Result<StatusCode, AppError> {
    claims.require(&[Role::Admin])?;
    let technician = Technician {
        id,
        name: req.name,
        sub_category_ids: req.sub_category_ids,
        active: req.active,
        approved: req.approved,
        location: req.location,
        coins: 0,
        created_at: Utc::now(),
    };
    state.engine.store().upsert_technician(&technician).await?;
    Ok(StatusCode::NO_CONTENT)
}
