//! Session registry: the only shared mutable state of the server.
//!
//! A session is created by a synchronous HTTP call, sits unbound until a
//! stream connection completes the [`bind::handshake`], and is removed
//! exactly once, either by [`SessionStore::terminate`] (with a final close
//! envelope on its transport) or silently by [`SessionStore::reclaim`] when
//! its bind deadline passes.
//!
//! Records are small and cheap to clone: lookups hand out a snapshot, and
//! [`SessionStore::replace`] writes a modified snapshot back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::{CloseStatus, Envelope};
use crate::transport::Transport;

pub mod bind;
pub mod resize;
pub mod supervisor;

use bind::{BindSignal, BindWaiter};
use resize::ResizeQueue;

/// Which bridge serves the session once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Resource,
    Terminal,
    Logs,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Resource => "resource",
            SessionKind::Terminal => "terminal",
            SessionKind::Logs => "logs",
        }
    }
}

/// Server-side state of one pending or bound stream.
#[derive(Clone)]
pub struct SessionRecord {
    pub id: String,
    pub kind: SessionKind,
    pub bind: Arc<BindSignal>,
    /// Attached by the bind handshake; `None` before bind.
    pub transport: Option<Arc<dyn Transport>>,
    /// Cancelled on termination to unwind workers spawned for the session.
    pub shutdown: CancellationToken,
    /// Terminal sessions only.
    pub resize: Option<Arc<ResizeQueue>>,
    pub created_at: Instant,
}

impl SessionRecord {
    /// Build an unbound record. The waiter goes to the bind supervisor.
    pub fn new(id: String, kind: SessionKind) -> (Self, BindWaiter) {
        let (bind, waiter) = BindSignal::new();
        let resize = (kind == SessionKind::Terminal).then(|| Arc::new(ResizeQueue::new()));
        (
            Self {
                id,
                kind,
                bind,
                transport: None,
                shutdown: CancellationToken::new(),
                resize,
                created_at: Instant::now(),
            },
            waiter,
        )
    }

    pub fn is_bound(&self) -> bool {
        self.transport.is_some()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("Maximum number of sessions ({0}) reached")]
    LimitReached(usize),
}

/// Storage seam for session records. All methods are safe under any number
/// of concurrent callers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new unbound record under `id`.
    async fn create(
        &self,
        id: String,
        kind: SessionKind,
    ) -> Result<(SessionRecord, BindWaiter), SessionError>;

    async fn get(&self, id: &str) -> Option<SessionRecord>;

    /// Overwrite an existing record. Fails if it was removed in the meantime.
    async fn replace(&self, record: SessionRecord) -> Result<(), SessionError>;

    /// Remove the record and notify its transport with a close envelope, the
    /// close status and `reason`. Returns `false` if the record was already
    /// gone, in which case nothing is sent.
    async fn terminate(&self, id: &str, status: CloseStatus, reason: &str) -> bool;

    /// Remove the record without contacting any transport.
    async fn reclaim(&self, id: &str) -> bool;

    async fn count(&self) -> usize;

    async fn ids(&self) -> Vec<String>;
}

/// In-memory [`SessionStore`] guarded by a single read/write lock.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Terminate every live session, e.g. on server shutdown.
    pub async fn terminate_all(&self, status: CloseStatus, reason: &str) {
        let ids = self.ids().await;
        for id in ids {
            self.terminate(&id, status, reason).await;
        }
    }
}

#[async_trait]
impl SessionStore for SessionRegistry {
    async fn create(
        &self,
        id: String,
        kind: SessionKind,
    ) -> Result<(SessionRecord, BindWaiter), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }
        let (record, waiter) = SessionRecord::new(id.clone(), kind);
        sessions.insert(id.clone(), record.clone());
        drop(sessions);
        info!("Session {id} created ({})", kind.as_str());
        Ok((record, waiter))
    }

    async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn replace(&self, record: SessionRecord) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&record.id) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(SessionError::NotFound(record.id)),
        }
    }

    async fn terminate(&self, id: &str, status: CloseStatus, reason: &str) -> bool {
        // Removal under the write lock elects a single terminator; the slow
        // transport work below happens after the lock is released.
        let Some(record) = self.sessions.write().await.remove(id) else {
            return false;
        };

        record.shutdown.cancel();
        if let Some(queue) = &record.resize {
            queue.close();
        }
        record.bind.abandon();

        if let Some(transport) = &record.transport {
            if transport.is_active() {
                if let Err(e) = transport.send(&Envelope::close(id, status, reason)).await {
                    debug!("Session {id}: close envelope not delivered: {e}");
                }
            }
            if let Err(e) = transport.close(status.code(), reason).await {
                debug!("Session {id}: transport close failed: {e}");
            }
        }

        info!("Session {id} terminated ({}): {reason}", status.code());
        true
    }

    async fn reclaim(&self, id: &str) -> bool {
        let Some(record) = self.sessions.write().await.remove(id) else {
            return false;
        };
        record.shutdown.cancel();
        if let Some(queue) = &record.resize {
            queue.close();
        }
        true
    }

    async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
