use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fanout_hub::{run_session, Hub, HubOptions, NoopCallbacks};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub options: HubOptions,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Recipient id this socket authenticates as. Omitted or 0 means
    /// unauthenticated: the session still counts toward `client_count` but
    /// never appears in per-recipient routing.
    #[serde(default)]
    recipient_id: u64,
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let options = state.options;
    upgrade
        .max_message_size(options.max_message_size)
        .on_upgrade(move |socket| async move {
            run_session(socket, query.recipient_id, state.hub, Arc::new(NoopCallbacks), options).await;
        })
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.hub.client_count().await;
    format!("ok, {count} connection(s)\n")
}
