//! Log bridge: forwards a container's log lines to a bound session.
//!
//! The stream starts as soon as the session is bound. Each line becomes one
//! `stdout` envelope. From the client only `stdin` (an acknowledgement,
//! logged and otherwise ignored) and `close` are meaningful.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backend::{LogBackend, LogRequest};
use crate::protocol::{CloseStatus, Envelope, Op};
use crate::sessions::{SessionRecord, SessionStore};
use crate::transport::{Transport, TransportError};

/// Close reason when the backend stream reaches its end.
pub const LOG_STREAM_ENDED: &str = "Log stream ended";
/// Close reason when the client closes the stream.
pub const LOG_STREAM_CLOSED: &str = "Log stream closed";

enum ClientEvent {
    Closed,
    Lost(TransportError),
}

/// Read client envelopes until the client closes or the transport fails.
async fn watch_client(id: &str, transport: &dyn Transport) -> ClientEvent {
    loop {
        let envelope = match transport.recv().await {
            Ok(envelope) => envelope,
            Err(TransportError::Malformed(e)) => {
                warn!("Session {id}: dropping malformed envelope: {e}");
                continue;
            }
            Err(e) => return ClientEvent::Lost(e),
        };
        if !envelope.session_id.is_empty() && envelope.session_id != id {
            continue;
        }
        match envelope.op {
            Op::Stdin => debug!("Session {id}: log stream acknowledged"),
            Op::Close => return ClientEvent::Closed,
            other => debug!("Session {id}: ignoring '{other}' on log stream"),
        }
    }
}

/// Stream `request` to the bound `record` until the backend ends, the client
/// closes, or the session is terminated elsewhere.
pub async fn run(
    store: &dyn SessionStore,
    record: &SessionRecord,
    logs: &dyn LogBackend,
    request: &LogRequest,
) {
    let id = record.id.as_str();
    let Some(transport) = record.transport.as_ref().map(Arc::clone) else {
        store
            .terminate(id, CloseStatus::Error, "log session is not bound")
            .await;
        return;
    };

    let mut stream = match logs.open(request).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Session {id}: failed to open log stream: {e}");
            store.terminate(id, CloseStatus::Error, &e.to_string()).await;
            return;
        }
    };
    info!(
        "Session {id}: streaming logs of {}/{} ({})",
        request.target.namespace, request.target.name, request.target.container
    );

    let client = watch_client(id, transport.as_ref());
    tokio::pin!(client);

    loop {
        tokio::select! {
            biased;
            () = record.shutdown.cancelled() => return,
            event = &mut client => {
                match event {
                    ClientEvent::Closed => {
                        store.terminate(id, CloseStatus::Info, LOG_STREAM_CLOSED).await;
                    }
                    ClientEvent::Lost(e) => {
                        store.terminate(id, CloseStatus::Error, &e.to_string()).await;
                    }
                }
                return;
            }
            line = stream.next_line() => match line {
                Ok(Some(line)) => {
                    let mut env = Envelope::with_data(Op::Stdout, line);
                    env.session_id = id.to_string();
                    if let Err(e) = transport.send(&env).await {
                        store.terminate(id, CloseStatus::Error, &e.to_string()).await;
                        return;
                    }
                }
                Ok(None) => {
                    store.terminate(id, CloseStatus::Info, LOG_STREAM_ENDED).await;
                    return;
                }
                Err(e) => {
                    error!("Session {id}: log stream failed: {e}");
                    store.terminate(id, CloseStatus::Error, &e.to_string()).await;
                    return;
                }
            },
        }
    }
}
