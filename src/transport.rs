//! Minimal byte-stream abstraction the protocol rides on.
//!
//! The core depends only on this contract; TCP is the bundled concrete
//! transport and an in-memory duplex pair is provided for tests and
//! in-process wiring. A WebSocket or TLS stream satisfying the trait
//! slots in without touching the protocol engine.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A bidirectional byte stream a [`crate::connection::Connection`] can
/// be bound to.
///
/// The transport carries no retry logic of its own; reconnection and
/// call replay are exclusively the connection and session layers'
/// responsibility. Close is observed by the driver exactly once, as
/// end-of-stream or as a terminal read/write error.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Best-effort diagnostic description of the remote endpoint.
    fn remote_address(&self) -> String;
}

impl Transport for TcpStream {
    fn remote_address(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_owned())
    }
}

/// In-memory transport, one half of a `tokio::io::duplex` pair.
impl Transport for DuplexStream {
    fn remote_address(&self) -> String {
        "<in-memory>".to_owned()
    }
}
