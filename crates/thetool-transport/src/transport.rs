//! The message transport seam shared by sockets and worker relays.

use async_trait::async_trait;
use thiserror::Error;

use crate::frame::FrameError;

/// Transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Worker relay failed: {0}")]
    Relay(String),
    #[error("Transport closed")]
    Closed,
}

/// Symmetric message pipe: opaque text out, opaque text in.
///
/// `recv` yields messages in arrival order and `Ok(None)` once the peer is
/// gone. Only one task is expected to call `recv`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message.
    async fn send(&self, message: String) -> Result<(), TransportError>;

    /// Receive the next message.
    async fn recv(&self) -> Result<Option<String>, TransportError>;

    /// Close the transport.
    async fn close(&self) -> Result<(), TransportError>;
}
