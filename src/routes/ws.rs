//! Stream endpoints: WebSocket upgrade followed by the bind handshake.
//!
//! A connection that fails the handshake is dropped without a reply. After a
//! successful bind the session's worker owns the transport and this task
//! returns.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::auth::ApiKey;
use crate::sessions::bind::handshake;
use crate::sessions::SessionKind;
use crate::state::AppState;
use crate::transport::ws::WsTransport;
use crate::transport::Transport;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// API key passed as a query parameter (no headers on browser upgrades).
    #[serde(default)]
    pub token: Option<String>,
}

fn upgrade(state: AppState, query: &StreamQuery, ws: WebSocketUpgrade, kind: SessionKind) -> Response {
    let key = ApiKey(state.config.auth.api_key.clone());
    if !key.accepts(query.token.as_deref()) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| attach(state, socket, kind))
}

async fn attach(state: AppState, socket: WebSocket, kind: SessionKind) {
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket));
    if let Err(rejection) = handshake(&state.sessions, transport, kind).await {
        debug!("{} stream dropped: {rejection:?}", kind.as_str());
    }
}

/// `GET /srv/data?token=<key>`
pub async fn resource_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &query, ws, SessionKind::Resource)
}

/// `GET /srv/shell?token=<key>`
pub async fn terminal_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &query, ws, SessionKind::Terminal)
}

/// `GET /srv/logs?token=<key>`
pub async fn log_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &query, ws, SessionKind::Logs)
}
