//! HTTP surface.
//!
//! Each stream kind has a creation call, which allocates a session and
//! starts its bind supervisor, and a WebSocket endpoint where the client
//! binds to it.
//!
//! | Method | Path                  | Auth   | Description                        |
//! |--------|-----------------------|--------|------------------------------------|
//! | GET    | `/healthz`            | No     | Liveness check                     |
//! | GET    | `/srv/data/ws`        | Bearer | Create a resource session          |
//! | GET    | `/srv/shell/exec`     | Bearer | Create a terminal session          |
//! | GET    | `/srv/logs/stream`    | Bearer | Create a log session               |
//! | GET    | `/srv/data`           | token  | Resource stream (WebSocket)        |
//! | GET    | `/srv/shell`          | token  | Terminal stream (WebSocket)        |
//! | GET    | `/srv/logs`           | token  | Log stream (WebSocket)             |
//!
//! Bearer and token checks only apply when `auth.api_key` is set.

pub mod health;
pub mod streams;
pub mod ws;

use axum::{middleware, routing::get, Extension, Router};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::state::AppState;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let config = &state.config;

    let create_routes = Router::new()
        .route("/srv/data/ws", get(streams::create_resource_session))
        .route("/srv/shell/exec", get(streams::create_terminal_session))
        .route("/srv/logs/stream", get(streams::create_log_session))
        .layer(ConcurrencyLimitLayer::new(config.server.max_concurrent_requests.max(1)))
        .layer(middleware::from_fn(auth::require_api_key));

    let stream_routes = Router::new()
        .route("/srv/data", get(ws::resource_stream))
        .route("/srv/shell", get(ws::terminal_stream))
        .route("/srv/logs", get(ws::log_stream));

    let mut app = Router::new()
        .route("/healthz", get(health::health))
        .merge(create_routes)
        .merge(stream_routes)
        .layer(Extension(ApiKey(config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http());

    if config.server.cors {
        app = app.layer(CorsLayer::permissive());
    }

    app.with_state(state)
}
