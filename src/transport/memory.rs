//! In-process transport backed by unbounded channels.
//!
//! [`pair`] returns the server half (a [`Transport`]) and a [`MemoryPeer`]
//! playing the client. The peer observes everything the server sends,
//! including the final close frame.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportError};
use crate::protocol::Envelope;

/// What the client side of a memory transport sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

pub struct MemoryTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    outbound: mpsc::UnboundedSender<Frame>,
    active: AtomicBool,
    closed: CancellationToken,
}

/// Client half of a [`MemoryTransport`].
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Create a connected server/client pair.
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            inbound: Mutex::new(server_rx),
            outbound: server_tx,
            active: AtomicBool::new(true),
            closed: CancellationToken::new(),
        },
        MemoryPeer {
            tx: Some(client_tx),
            rx: client_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Frame::Envelope(envelope.clone()))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Envelope, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::Closed),
            msg = inbound.recv() => msg.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.closed.cancel();
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.outbound
            .send(Frame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl MemoryPeer {
    /// Deliver an envelope to the server. Returns `false` once the server
    /// half is gone or the peer hung up.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(envelope).is_ok())
    }

    /// Next frame from the server, `None` once the server half is dropped.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`MemoryPeer::next`].
    pub fn try_next(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Drop the client's sending half, as if the connection was lost.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;

    #[tokio::test]
    async fn envelopes_flow_both_ways() {
        let (server, mut client) = pair();
        assert!(client.send(Envelope::with_data(Op::Stdin, "ls\n")));
        let got = server.recv().await.unwrap();
        assert_eq!(got.op, Op::Stdin);

        server.send(&Envelope::with_data(Op::Stdout, "out")).await.unwrap();
        assert_eq!(
            client.next().await,
            Some(Frame::Envelope(Envelope::with_data(Op::Stdout, "out")))
        );
    }

    #[tokio::test]
    async fn close_is_reported_once_and_blocks_further_sends() {
        let (server, mut client) = pair();
        server.close(3000, "done").await.unwrap();
        server.close(3002, "again").await.unwrap();
        assert!(!server.is_active());
        assert!(server.send(&Envelope::new(Op::Stdout)).await.is_err());
        assert_eq!(
            client.next().await,
            Some(Frame::Close {
                code: 3000,
                reason: "done".into()
            })
        );
        assert!(client.try_next().is_none());
    }

    #[tokio::test]
    async fn hang_up_surfaces_as_closed() {
        let (server, mut client) = pair();
        client.hang_up();
        assert_eq!(server.recv().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn local_close_wakes_a_blocked_reader() {
        let (server, _client) = pair();
        let server = std::sync::Arc::new(server);
        let reader = {
            let server = std::sync::Arc::clone(&server);
            tokio::spawn(async move { server.recv().await })
        };
        tokio::task::yield_now().await;
        server.close(3000, "bye").await.unwrap();
        assert_eq!(reader.await.unwrap(), Err(TransportError::Closed));
    }
}
