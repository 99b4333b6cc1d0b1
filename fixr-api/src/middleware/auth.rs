use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fixr_dispatch::Actor;
use fixr_shared::Recipient;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Customer,
    Technician,
    Admin,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

impl Claims {
    pub fn actor(&self) -> Actor {
        match self.role {
            Role::Customer => Actor::Customer(self.sub),
            Role::Technician => Actor::Technician(self.sub),
            Role::Admin => Actor::Admin(self.sub),
        }
    }

    /// Push-event address for this caller. Admins have none.
    pub fn recipient(&self) -> Option<Recipient> {
        match self.role {
            Role::Customer => Some(Recipient::Customer(self.sub)),
            Role::Technician => Some(Recipient::Technician(self.sub)),
            Role::Admin => None,
        }
    }

    pub fn require(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::AuthorizationError(format!("{:?} may not perform this action", self.role)))
        }
    }
}

pub fn issue_token(secret: &str, user_id: Uuid, role: Role, ttl_seconds: u64) -> Result<String, AppError> {
    let claims = Claims {
        sub: user_id,
        role,
        exp: (Utc::now() + Duration::seconds(ttl_seconds as i64)).timestamp() as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::InternalServerError(format!("Token encoding failed: {}", e)))
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header.strip_prefix("Bearer ").ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!("Rejected bearer token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip_keeps_role() {
        let user = Uuid::new_v4();
        let token = issue_token("secret", user, Role::Technician, 60).unwrap();

        let data = decode::<Claims>(&token, &DecodingKey::from_secret(b"secret"), &Validation::default()).unwrap();
        assert_eq!(data.claims.sub, user);
        assert_eq!(data.claims.actor(), Actor::Technician(user));
        assert!(data.claims.require(&[Role::Customer]).is_err());
        assert!(data.claims.require(&[Role::Technician, Role::Admin]).is_ok());
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = issue_token("secret", Uuid::new_v4(), Role::Customer, 60).unwrap();
        assert!(decode::<Claims>(&token, &DecodingKey::from_secret(b"other"), &Validation::default()).is_err());
    }
}
