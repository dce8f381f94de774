//! One-shot bind signal and the bind handshake.
//!
//! Each session record carries a [`BindSignal`]. Two parties race for it:
//! the handshake of an incoming connection and the bind-timeout supervisor.
//! Whoever wins [`BindSignal::try_claim`] decides the session's fate; the
//! loser backs off. The signal is fulfilled at most once, and only by the
//! handshake after it has attached the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{SessionKind, SessionStore};
use crate::protocol::{Envelope, Op};
use crate::transport::Transport;

pub struct BindSignal {
    claimed: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

/// Receiving end of a [`BindSignal`], owned by the supervisor.
pub type BindWaiter = oneshot::Receiver<()>;

impl BindSignal {
    pub fn new() -> (Arc<Self>, BindWaiter) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                claimed: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Claim the signal. Exactly one caller ever gets `true`.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Fulfil the signal. Later calls are no-ops and return `false`.
    pub fn fulfil(&self) -> bool {
        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Give up a claim without fulfilling, waking the supervisor with an
    /// error so it can reclaim the record.
    pub fn abandon(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// Why a connection was refused during the handshake. Never sent to the
/// client; the connection is simply dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindRejection {
    /// The connection closed or failed before the first envelope.
    NoEnvelope,
    /// The first envelope was not `bind`.
    NotBind(Op),
    /// No record with that id exists (never created, or already reclaimed).
    UnknownSession(String),
    /// The record belongs to a different stream endpoint.
    WrongKind(String),
    /// The record was already bound or already reclaimed by its deadline.
    AlreadyClaimed(String),
}

/// Run the bind handshake on a freshly accepted transport connected to the
/// endpoint serving `kind` sessions.
///
/// On success the transport is attached to the record, the record is
/// stored back, a bind acknowledgement is sent, and the bind signal is
/// fulfilled. Returns the bound session id.
pub async fn handshake(
    store: &dyn SessionStore,
    transport: Arc<dyn Transport>,
    kind: SessionKind,
) -> Result<String, BindRejection> {
    let first = match transport.recv().await {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Bind: no envelope received: {e}");
            return Err(BindRejection::NoEnvelope);
        }
    };

    if first.op != Op::Bind {
        warn!("Bind: expected 'bind', got '{}'", first.op);
        return Err(BindRejection::NotBind(first.op));
    }

    let id = first.session_id;
    let Some(mut record) = store.get(&id).await else {
        warn!("Bind: unknown session '{id}'");
        return Err(BindRejection::UnknownSession(id));
    };

    if record.kind != kind {
        warn!(
            "Bind: session {id} is a {} session, not {}",
            record.kind.as_str(),
            kind.as_str()
        );
        return Err(BindRejection::WrongKind(id));
    }

    if !record.bind.try_claim() {
        warn!("Bind: session {id} already bound or expired");
        return Err(BindRejection::AlreadyClaimed(id));
    }

    record.transport = Some(Arc::clone(&transport));
    let signal = Arc::clone(&record.bind);
    if store.replace(record).await.is_err() {
        // Terminated between lookup and claim.
        signal.abandon();
        return Err(BindRejection::UnknownSession(id));
    }

    let mut ack = Envelope::new(Op::Bind);
    ack.session_id.clone_from(&id);
    if let Err(e) = transport.send(&ack).await {
        debug!("Bind: failed to acknowledge session {id}: {e}");
    }

    signal.fulfil();
    info!("Session {id} bound");
    Ok(id)
}
