//! Duplex envelope transports.
//!
//! The session layer only ever talks to a [`Transport`]; the concrete
//! technology behind it is chosen by the route that accepted the connection.
//!
//! - [`ws::WsTransport`]: axum WebSocket, one JSON envelope per text frame.
//! - [`memory::MemoryTransport`]: in-process channel pair, used by tests and
//!   by embedders driving sessions without a socket.

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::Envelope;

pub mod memory;
pub mod ws;

/// Failures on an attached transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer went away or the transport was closed locally.
    #[error("connection closed")]
    Closed,
    /// A frame arrived that is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Socket(String),
}

/// A bidirectional stream of [`Envelope`]s.
///
/// All methods take `&self` so one transport can be shared between a reader
/// and a writer task. Sends are delivered in call order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Block until the next envelope arrives.
    async fn recv(&self) -> Result<Envelope, TransportError>;

    /// Close the connection with a status code and human-readable reason.
    /// Closing twice is harmless.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;

    fn is_active(&self) -> bool;
}
