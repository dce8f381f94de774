//! Terminal bridge: interactive exec over a bound session.
//!
//! [`TerminalBridge`] turns envelope traffic into the byte and size streams an
//! [`ExecBackend`] consumes:
//!
//! | Client envelope | Effect                                                   |
//! |-----------------|----------------------------------------------------------|
//! | `stdin`         | payload bytes handed to the remote process               |
//! | `resize`        | `{rows, cols}` stored in the resize queue, zero bytes    |
//! | `close`         | end-of-transmission byte, then input ends                |
//! | anything else   | end-of-transmission byte, then a protocol error          |
//!
//! Output chunks go back as `stdout` envelopes. The client's terminal sends
//! `stdin` and `resize` without a `sessionId`, so an empty id is accepted here;
//! a non-empty id belonging to another session is ignored.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{BridgeError, ByteSink, ByteSource, InputClosed, SizeSource};
use crate::backend::{ExecBackend, ExecRequest, ExecStreams};
use crate::protocol::{CloseStatus, Envelope, Op, END_OF_TRANSMISSION};
use crate::sessions::resize::{ResizeQueue, TerminalSize};
use crate::sessions::{SessionRecord, SessionStore};
use crate::transport::{Transport, TransportError};

/// Close reason when the remote process ends normally.
pub const PROCESS_EXITED: &str = "Process exited";

pub struct TerminalBridge {
    session_id: String,
    transport: Arc<dyn Transport>,
    resize: Arc<ResizeQueue>,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last write.
    carry: Mutex<Vec<u8>>,
}

impl TerminalBridge {
    pub fn new(session_id: String, transport: Arc<dyn Transport>, resize: Arc<ResizeQueue>) -> Self {
        Self {
            session_id,
            transport,
            resize,
            carry: Mutex::new(Vec::new()),
        }
    }

    /// Bridge for a bound terminal record; `None` if the record has no
    /// transport or no resize queue.
    pub fn from_record(record: &SessionRecord) -> Option<Self> {
        Some(Self::new(
            record.id.clone(),
            Arc::clone(record.transport.as_ref()?),
            Arc::clone(record.resize.as_ref()?),
        ))
    }

    /// Show a transient out-of-band message in the client's terminal.
    pub async fn toast(&self, message: &str) -> Result<(), BridgeError> {
        let mut env = Envelope::with_data(Op::Toast, message);
        env.session_id.clone_from(&self.session_id);
        self.transport.send(&env).await?;
        Ok(())
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        envelope.session_id.is_empty() || envelope.session_id == self.session_id
    }
}

fn input_closed(cause: BridgeError) -> InputClosed {
    InputClosed {
        trailing: vec![END_OF_TRANSMISSION],
        cause,
    }
}

/// Take the longest valid UTF-8 prefix of `pending`, leaving an incomplete
/// trailing sequence for the next call. Invalid bytes are replaced.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[async_trait]
impl ByteSource for TerminalBridge {
    async fn read(&self) -> Result<Vec<u8>, InputClosed> {
        loop {
            let envelope = match self.transport.recv().await {
                Ok(envelope) => envelope,
                Err(e) => return Err(input_closed(BridgeError::Transport(e))),
            };

            if !self.accepts(&envelope) {
                debug!(
                    "Session {}: ignoring '{}' addressed to '{}'",
                    self.session_id, envelope.op, envelope.session_id
                );
                continue;
            }

            return match envelope.op {
                Op::Stdin => Ok(envelope.data.into_bytes()),
                Op::Resize => {
                    let size = TerminalSize::new(
                        envelope.rows.unwrap_or_default(),
                        envelope.cols.unwrap_or_default(),
                    );
                    debug!("Session {}: resize to {}x{}", self.session_id, size.cols, size.rows);
                    self.resize.push(size);
                    Ok(Vec::new())
                }
                Op::Close => Err(input_closed(BridgeError::ClientClosed)),
                other => Err(input_closed(BridgeError::UnknownOp(other))),
            };
        }
    }
}

#[async_trait]
impl ByteSink for TerminalBridge {
    async fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let text = {
            let mut carry = self.carry.lock().unwrap_or_else(PoisonError::into_inner);
            carry.extend_from_slice(bytes);
            drain_utf8(&mut carry)
        };
        if text.is_empty() {
            return Ok(());
        }
        let mut env = Envelope::with_data(Op::Stdout, text);
        env.session_id.clone_from(&self.session_id);
        self.transport.send(&env).await?;
        Ok(())
    }
}

#[async_trait]
impl SizeSource for TerminalBridge {
    async fn next_size(&self) -> Option<TerminalSize> {
        let size = self.resize.next().await;
        (!size.is_sentinel()).then_some(size)
    }
}

/// Run `request` for a bound terminal session and terminate the session when
/// the remote process ends. `notice`, if any, is shown to the user first.
pub async fn run(
    store: &dyn SessionStore,
    record: &SessionRecord,
    exec: &dyn ExecBackend,
    request: &ExecRequest,
    notice: Option<&str>,
) {
    let id = record.id.as_str();
    let Some(bridge) = TerminalBridge::from_record(record).map(Arc::new) else {
        store
            .terminate(id, CloseStatus::Error, "terminal session is not bound")
            .await;
        return;
    };

    if let Some(message) = notice {
        if let Err(e) = bridge.toast(message).await {
            debug!("Session {id}: toast not delivered: {e}");
        }
    }

    info!(
        "Session {id}: exec {:?} in {}/{} ({})",
        request.command, request.target.namespace, request.target.name, request.target.container
    );
    let streams = ExecStreams {
        stdin: Arc::clone(&bridge) as Arc<dyn ByteSource>,
        stdout: Arc::clone(&bridge) as Arc<dyn ByteSink>,
        stderr: None,
        resize: Arc::clone(&bridge) as Arc<dyn SizeSource>,
    };

    match exec.stream(request, streams, record.shutdown.clone()).await {
        Ok(()) => {
            store.terminate(id, CloseStatus::Info, PROCESS_EXITED).await;
        }
        Err(e) => {
            if !record.shutdown.is_cancelled() {
                error!("Session {id}: exec failed: {e}");
            }
            store.terminate(id, CloseStatus::Error, &e.to_string()).await;
        }
    }
}

/// Whether an input failure is the client going away rather than a fault.
pub fn is_client_gone(cause: &BridgeError) -> bool {
    matches!(
        cause,
        BridgeError::ClientClosed | BridgeError::Transport(TransportError::Closed)
    )
}
