//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::sessions::SessionStore;
use crate::state::AppState;

/// `GET /healthz`: liveness check.
///
/// Returns status, version, uptime and the number of live sessions (pending
/// and bound). No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.sessions.count().await;

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "sessions": sessions,
    }))
}
