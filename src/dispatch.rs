//! Per-session request/reply loop.
//!
//! One loop runs per bound session. It is the only reader of the session's
//! transport, handles one envelope at a time, and writes each reply before
//! reading the next request, so replies always come back in request order.
//!
//! | Incoming                              | Action                                     |
//! |---------------------------------------|--------------------------------------------|
//! | transport error / closed              | terminate with error status, exit          |
//! | malformed frame                       | ignored                                    |
//! | `sessionId` not matching the session  | ignored                                    |
//! | `close`                               | terminate with info status, exit           |
//! | tag accepted by the [`OpHandler`]     | reply with same tag and `opId`, continue   |
//! | any other tag                         | ignored                                    |

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::{CloseStatus, Envelope, Op};
use crate::sessions::{SessionRecord, SessionStore};
use crate::transport::TransportError;

/// Reason given to the client when it closes a request/reply session.
pub const CLIENT_CLOSE_REASON: &str = "Process exited";

/// Domain side of the dispatch loop.
#[async_trait]
pub trait OpHandler: Send + Sync {
    /// Handle `request`. Returns `None` for tags this handler does not serve;
    /// backend failures are reported inside the returned reply, not as `None`.
    async fn handle(&self, request: &Envelope) -> Option<Envelope>;
}

/// Why a dispatch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEnd {
    /// The client sent `close`.
    ClientClosed,
    /// Reading or writing the transport failed.
    TransportFailed(TransportError),
    /// The session was terminated from elsewhere.
    Cancelled,
}

/// Run the loop for a bound `record` until it ends, terminating the session
/// on the way out.
pub async fn run(
    store: &dyn SessionStore,
    record: &SessionRecord,
    handler: &dyn OpHandler,
) -> DispatchEnd {
    let Some(transport) = record.transport.as_ref().map(Arc::clone) else {
        return DispatchEnd::Cancelled;
    };
    let id = record.id.as_str();

    let end = loop {
        let incoming = tokio::select! {
            biased;
            () = record.shutdown.cancelled() => break DispatchEnd::Cancelled,
            incoming = transport.recv() => incoming,
        };

        let request = match incoming {
            Ok(envelope) => envelope,
            Err(TransportError::Malformed(e)) => {
                warn!("Session {id}: dropping malformed envelope: {e}");
                continue;
            }
            Err(e) => break DispatchEnd::TransportFailed(e),
        };

        if request.session_id != id {
            debug!(
                "Session {id}: ignoring '{}' addressed to '{}'",
                request.op, request.session_id
            );
            continue;
        }

        if request.op == Op::Close {
            break DispatchEnd::ClientClosed;
        }

        let Some(reply) = handler.handle(&request).await else {
            debug!("Session {id}: no handler for '{}'", request.op);
            continue;
        };
        if let Err(e) = transport.send(&reply).await {
            break DispatchEnd::TransportFailed(e);
        }
    };

    match &end {
        DispatchEnd::ClientClosed => {
            store.terminate(id, CloseStatus::Info, CLIENT_CLOSE_REASON).await;
        }
        DispatchEnd::TransportFailed(e) => {
            store.terminate(id, CloseStatus::Error, &e.to_string()).await;
        }
        DispatchEnd::Cancelled => {}
    }
    end
}
