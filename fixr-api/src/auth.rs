use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::{issue_token, Role};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct TokenRequest {
    user_id: Option<Uuid>,
    role: Role,
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    token: String,
    user_id: Uuid,
}

/// Token minting for local development. Production tokens come from the
/// identity service.
pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/auth/dev-token", post(dev_token))
}

async fn dev_token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let user_id = req.user_id.unwrap_or_else(Uuid::new_v4);
    let token = issue_token(&state.auth.secret, user_id, req.role, state.auth.expiration)?;
    Ok(Json(AuthResponse { token, user_id }))
}
