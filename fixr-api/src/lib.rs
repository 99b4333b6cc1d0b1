use axum::{http::Method, middleware::from_fn_with_state, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod auth;
pub mod bookings;
pub mod error;
pub mod events;
pub mod middleware;
pub mod payments;
pub mod state;
pub mod technicians;
pub mod worker;

pub use state::AppState;

use crate::middleware::{auth_middleware, rate_limit_middleware};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let protected = Router::new()
        .merge(bookings::routes())
        .merge(payments::routes())
        .merge(technicians::routes())
        .merge(events::routes())
        .merge(admin::routes())
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let mut router = Router::new().route("/health", get(health)).merge(protected);
    if state.auth.dev_tokens {
        tracing::warn!("Development token endpoint is enabled");
        router = router.merge(auth::routes());
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
