//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::backend::Backends;
use crate::config::Config;
use crate::sessions::{SessionRegistry, SessionStore};

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub sessions: SessionRegistry,
    pub backends: Backends,
}

impl AppState {
    pub fn new(config: Config, backends: Backends) -> Self {
        let sessions = SessionRegistry::new(config.server.max_sessions);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            sessions,
            backends,
        }
    }

    /// The registry as the trait object the session machinery works with.
    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::new(self.sessions.clone())
    }
}
