//! Adapters between a bound session transport and its backend.
//!
//! - [`resource`]: request/reply, one backend call per envelope
//! - [`terminal`]: bidirectional bytes plus resize signalling
//! - [`logs`]: one-directional line forwarding
//!
//! The terminal bridge hands the exec backend three narrow capabilities
//! instead of the transport itself: a [`ByteSource`], a [`ByteSink`] and a
//! [`SizeSource`].

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::Op;
use crate::sessions::resize::TerminalSize;
use crate::transport::TransportError;

pub mod logs;
pub mod resource;
pub mod terminal;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The client sent `close`.
    #[error("client closed the stream")]
    ClientClosed,
    /// A tag the terminal input does not accept.
    #[error("unexpected '{0}' message on terminal stream")]
    UnknownOp(Op),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// End of client input. `trailing` holds the bytes to deliver to the remote
/// process before it observes end of stream (the end-of-transmission byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputClosed {
    pub trailing: Vec<u8>,
    pub cause: BridgeError,
}

/// Bytes coming from the client.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Wait for the next chunk. An empty chunk is not end of stream; call
    /// again.
    async fn read(&self) -> Result<Vec<u8>, InputClosed>;
}

/// Bytes going to the client.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), BridgeError>;
}

/// Terminal size changes requested by the client.
#[async_trait]
pub trait SizeSource: Send + Sync {
    /// Wait for the next size. `None` means no more resizes will come.
    async fn next_size(&self) -> Option<TerminalSize>;
}
