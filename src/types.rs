//! Core types for the JSTP protocol: identifiers, constants and errors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// How long a freshly accepted (or freshly dialed) connection may stay
/// in the awaiting-handshake state before it is force-closed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Packet index reserved for the handshake exchange.
pub const HANDSHAKE_INDEX: u64 = 0;

/// Opaque session token issued at the first successful handshake.
///
/// A session outlives any single transport: a client holding the token
/// may resume the session over a replacement connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_owned())
    }
}

/// Per-process unique identifier of one connection instance.
pub type ConnectionId = u64;

/// Application-level error carried inside a CALLBACK packet.
///
/// Wire shape is `[code, "message"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Handshake named an application the server does not host.
    pub fn app_not_found(app: &str) -> Self {
        Self::new(10, format!("application not found: {app}"))
    }

    /// The authentication provider rejected the handshake.
    pub fn auth_failed(reason: &str) -> Self {
        Self::new(11, format!("authentication failed: {reason}"))
    }

    /// INSPECT named an interface the application does not export.
    pub fn interface_not_found(interface: &str) -> Self {
        Self::new(12, format!("interface not found: {interface}"))
    }

    /// CALL named a method the application does not export.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(14, format!("method not found: {method}"))
    }

    /// Resume was attempted with an unknown session token.
    pub fn session_not_found(session: &str) -> Self {
        Self::new(18, format!("session not found: {session}"))
    }

    /// Map a handshake rejection back to the error the dialer sees.
    pub fn into_handshake_error(self) -> JstpError {
        match self.code {
            10 => JstpError::UnknownApplication(self.message),
            11 => JstpError::Authentication(self.message),
            18 => JstpError::UnknownSession,
            _ => JstpError::Remote(self),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.code),
            Value::String(self.message.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        let code = arr.first()?.as_i64()?;
        let message = arr.get(1).and_then(Value::as_str).unwrap_or("").to_owned();
        Some(Self::new(code, message))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RemoteError {}

/// Everything that can go wrong inside the protocol engine.
#[derive(Debug, Error)]
pub enum JstpError {
    /// I/O-level transport fault, typically terminal for the connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Inbound bytes that do not decode to a valid packet. The packet
    /// is dropped and reported; the connection stays alive.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The peer did not complete the handshake within [`HANDSHAKE_TIMEOUT`].
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Resume was attempted with a session identifier the server has
    /// no record of. The caller must fall back to a fresh handshake.
    #[error("unknown session")]
    UnknownSession,

    /// Handshake named an application the server does not host.
    #[error("unknown application: {0}")]
    UnknownApplication(String),

    /// The authentication provider rejected the handshake.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The transport dropped while a non-resendable call was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection (or server) was already closed when the
    /// operation was issued.
    #[error("connection closed")]
    Closed,

    /// The remote application returned an error in its CALLBACK.
    #[error("remote error: {0}")]
    Remote(RemoteError),
}

impl From<RemoteError> for JstpError {
    fn from(e: RemoteError) -> Self {
        JstpError::Remote(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_error_value_round_trip() {
        let err = RemoteError::new(11, "method not found: calc.sub");
        let restored = RemoteError::from_value(&err.to_value()).unwrap();
        assert_eq!(err, restored);
    }

    #[test]
    fn remote_error_rejects_non_array() {
        assert!(RemoteError::from_value(&json!("oops")).is_none());
        assert!(RemoteError::from_value(&json!({"code": 1})).is_none());
    }

    #[test]
    fn remote_error_tolerates_missing_message() {
        let err = RemoteError::from_value(&json!([42])).unwrap();
        assert_eq!(err.code, 42);
        assert_eq!(err.message, "");
    }
}
