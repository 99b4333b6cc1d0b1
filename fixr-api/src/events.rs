use std::convert::Infallible;

use axum::{
    extract::{Extension, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_util::{Stream, StreamExt};
use tracing::info;

use crate::error::AppError;
use crate::middleware::Claims;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/events", get(stream_events))
}

/// Server-sent stream of the caller's booking events. Closing the connection
/// drops the subscription.
async fn stream_events(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let recipient = claims
        .recipient()
        .ok_or_else(|| AppError::AuthorizationError("admins have no event feed".into()))?;

    info!("Opening event stream for {:?}", recipient);
    let stream = state.events.subscribe(recipient).map(|envelope| {
        let event = Event::default().event(envelope.event.name()).id(envelope.id.to_string());
        Ok(match serde_json::to_string(&envelope) {
            Ok(json) => event.data(json),
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                event.comment("serialization failed")
            }
        })
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
