//! WebSocket transport over an upgraded axum socket.
//!
//! The socket is split: a writer task owns the sink and drains an mpsc
//! channel, so any number of callers can send without holding the socket
//! and frames leave in the order they were queued. The stream half sits
//! behind a mutex and is read by whoever calls [`Transport::recv`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{Transport, TransportError};
use crate::protocol::Envelope;

/// Close-frame payloads are limited to 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON: usize = 123;

/// Outbound frames buffered before `send` applies back-pressure.
const OUTBOUND_CAPACITY: usize = 256;

pub struct WsTransport {
    outbound: mpsc::Sender<Message>,
    inbound: Mutex<SplitStream<WebSocket>>,
    active: Arc<AtomicBool>,
    /// Fires on local close so a blocked `recv` returns.
    closed: CancellationToken,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (mut sink, stream) = socket.split();
        let (outbound, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let active = Arc::new(AtomicBool::new(true));

        let writer_active = Arc::clone(&active);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("WS writer stopped: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_active.store(false, Ordering::Release);
        });

        Self {
            outbound,
            inbound: Mutex::new(stream),
            active,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        let text = serde_json::to_string(envelope).map_err(|e| {
            error!("WS send: failed to serialize envelope: {e}");
            TransportError::Malformed(e.to_string())
        })?;
        self.outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        let mut stream = self.inbound.lock().await;
        loop {
            let next = tokio::select! {
                () = self.closed.cancelled() => return Err(TransportError::Closed),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    self.active.store(false, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => {
                    self.active.store(false, Ordering::Release);
                    return Err(TransportError::Socket(e.to_string()));
                }
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.closed.cancel();
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = CloseFrame {
            code,
            reason: truncate_reason(reason).to_owned().into(),
        };
        self.outbound
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Cut `reason` to fit a close frame without splitting a UTF-8 sequence.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reasons_are_untouched() {
        assert_eq!(truncate_reason("Process exited"), "Process exited");
    }

    #[test]
    fn long_reasons_fit_a_control_frame() {
        let reason = "é".repeat(100);
        let cut = truncate_reason(&reason);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
