//! Session creation calls.
//!
//! Each call allocates an unbound session, spawns its bind supervisor with
//! the worker that will serve it once bound, and answers with the session id.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::{BackendError, ExecBackend, ExecRequest, LogRequest, PodTarget};
use crate::bridges::resource::ResourceBridge;
use crate::bridges::{logs, terminal};
use crate::dispatch;
use crate::protocol::CreateResponse;
use crate::sessions::bind::BindWaiter;
use crate::sessions::resize::TerminalSize;
use crate::sessions::supervisor::supervise;
use crate::sessions::{SessionError, SessionKind, SessionRecord, SessionStore};
use crate::state::AppState;
use crate::util::gen_session_id;

type Created = (StatusCode, Json<CreateResponse>);

fn created(id: String) -> Created {
    (
        StatusCode::OK,
        Json(CreateResponse {
            session_id: id,
            status_code: u32::from(StatusCode::OK.as_u16()),
            error: String::new(),
        }),
    )
}

fn failed(status: StatusCode, error: impl Into<String>) -> Created {
    (
        status,
        Json(CreateResponse {
            session_id: String::new(),
            status_code: u32::from(status.as_u16()),
            error: error.into(),
        }),
    )
}

async fn allocate(
    store: &dyn SessionStore,
    kind: SessionKind,
) -> Result<(SessionRecord, BindWaiter), Created> {
    store
        .create(gen_session_id(), kind)
        .await
        .map_err(|e| match e {
            SessionError::LimitReached(_) => failed(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            _ => failed(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })
}

/// `GET /srv/data/ws`: create a resource session.
pub async fn create_resource_session(State(state): State<AppState>) -> Created {
    let store = state.store();
    let (record, waiter) = match allocate(store.as_ref(), SessionKind::Resource).await {
        Ok(created) => created,
        Err(response) => return response,
    };
    let id = record.id.clone();
    let bridge = ResourceBridge::new(
        Arc::clone(&state.backends.cluster),
        Arc::clone(&state.backends.packages),
    );
    let deadline = state.config.sessions.bind_timeout();

    let worker_store = Arc::clone(&store);
    tokio::spawn(supervise(store, record, waiter, deadline, move |bound| async move {
        let end = dispatch::run(worker_store.as_ref(), &bound, &bridge).await;
        debug!("Session {}: dispatch ended: {end:?}", bound.id);
    }));

    created(id)
}

/// Pod and container addressed by a terminal or log creation call.
#[derive(Debug, Default, Deserialize)]
pub struct PodQuery {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub container: String,
}

impl PodQuery {
    fn target(&self) -> Result<PodTarget, Created> {
        if self.name.is_empty() {
            return Err(failed(StatusCode::BAD_REQUEST, "pod name is required"));
        }
        let target = PodTarget {
            name: self.name.clone(),
            namespace: if self.namespace.is_empty() {
                "default".into()
            } else {
                self.namespace.clone()
            },
            container: self.container.clone(),
        };
        target
            .validate()
            .map_err(|e| failed(StatusCode::BAD_REQUEST, e.to_string()))?;
        Ok(target)
    }
}

/// Choose the shell for a terminal session from the listing of the
/// container's `/etc/shells`. Returns the shell and, when it is not the
/// preferred one, a notice for the user.
pub fn pick_shell(
    listing: Result<&str, &BackendError>,
    allowed: &[String],
) -> Result<(String, Option<String>), String> {
    let permitted = |shell: &str| allowed.iter().any(|s| s == shell);
    let notice = match listing {
        Ok(listing) => {
            let has_bash = listing
                .lines()
                .any(|line| line.trim().rsplit('/').next() == Some("bash"));
            if has_bash && permitted("bash") {
                return Ok(("bash".into(), None));
            }
            if has_bash {
                Some("bash is not permitted, using sh".to_string())
            } else {
                Some("bash is not available in this container, using sh".to_string())
            }
        }
        Err(e) => Some(format!("Could not list the container's shells ({e}), using sh")),
    };
    if permitted("sh") {
        Ok(("sh".into(), notice))
    } else {
        Err("no permitted shell is available".into())
    }
}

async fn detect_shell(
    exec: &dyn ExecBackend,
    target: &PodTarget,
    allowed: &[String],
) -> Result<(String, Option<String>), String> {
    let command = ["grep", "-E", "^/bin", "/etc/shells"].map(String::from);
    let listing = exec.capture(target, &command).await;
    if let Err(e) = &listing {
        warn!("Listing shells in {}/{} failed: {e}", target.namespace, target.name);
    }
    pick_shell(listing.as_deref(), allowed)
}

/// `GET /srv/shell/exec?name&namespace&container`: create a terminal session.
pub async fn create_terminal_session(
    State(state): State<AppState>,
    Query(query): Query<PodQuery>,
) -> Created {
    let target = match query.target() {
        Ok(target) => target,
        Err(response) => return response,
    };
    let exec = Arc::clone(&state.backends.exec);
    let terminal_config = &state.config.terminal;
    let (shell, notice) = match detect_shell(exec.as_ref(), &target, &terminal_config.shells).await {
        Ok(choice) => choice,
        Err(e) => return failed(StatusCode::BAD_REQUEST, e),
    };

    let store = state.store();
    let (record, waiter) = match allocate(store.as_ref(), SessionKind::Terminal).await {
        Ok(created) => created,
        Err(response) => return response,
    };
    let id = record.id.clone();
    let request = ExecRequest {
        target,
        command: vec![shell],
        initial_size: TerminalSize::new(terminal_config.default_rows, terminal_config.default_cols),
    };
    let deadline = state.config.sessions.bind_timeout();

    let worker_store = Arc::clone(&store);
    tokio::spawn(supervise(store, record, waiter, deadline, move |bound| async move {
        terminal::run(
            worker_store.as_ref(),
            &bound,
            exec.as_ref(),
            &request,
            notice.as_deref(),
        )
        .await;
    }));

    created(id)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    #[serde(flatten)]
    pub pod: PodQuery,
    #[serde(default)]
    pub follow: String,
    #[serde(default)]
    pub tail_lines: String,
}

impl LogQuery {
    fn request(&self) -> Result<LogRequest, Created> {
        let tail_lines = match self.tail_lines.trim() {
            "" => None,
            raw => Some(raw.parse::<i64>().map_err(|_| {
                failed(StatusCode::BAD_REQUEST, format!("invalid tailLines '{raw}'"))
            })?),
        };
        Ok(LogRequest {
            target: self.pod.target()?,
            follow: matches!(self.follow.as_str(), "true" | "1"),
            tail_lines,
        })
    }
}

/// `GET /srv/logs/stream?name&namespace&container&follow&tailLines`: create a
/// log session.
pub async fn create_log_session(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Created {
    let request = match query.request() {
        Ok(request) => request,
        Err(response) => return response,
    };

    let store = state.store();
    let (record, waiter) = match allocate(store.as_ref(), SessionKind::Logs).await {
        Ok(created) => created,
        Err(response) => return response,
    };
    let id = record.id.clone();
    let backend = Arc::clone(&state.backends.logs);
    let deadline = state.config.sessions.logs_bind_timeout();

    let worker_store = Arc::clone(&store);
    tokio::spawn(supervise(store, record, waiter, deadline, move |bound| async move {
        logs::run(worker_store.as_ref(), &bound, backend.as_ref(), &request).await;
    }));

    created(id)
}
