//! # JSTP
//!
//! A connection-oriented application-layer protocol that multiplexes
//! remote method calls, callbacks and events over an arbitrary
//! byte-stream transport, and survives transport interruption through
//! session resumption and call replay.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jstp::{Application, ApplicationRegistry, Interface, JstpServer, ServerConfig};
//! use serde_json::{json, Value};
//!
//! # async fn demo() -> Result<(), jstp::JstpError> {
//! let app = Application::new("testApp").interface(
//!     "calculator",
//!     Interface::new().method("add", |_conn, args| async move {
//!         let a = args.first().and_then(Value::as_i64).unwrap_or(0);
//!         let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
//!         Ok(Some(json!(a + b)))
//!     }),
//! );
//!
//! let registry = ApplicationRegistry::new([app]);
//! let server = JstpServer::bind("127.0.0.1:3228", ServerConfig::new(registry)).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.run());
//!
//! let connection = jstp::tcp::connect("testApp", None, addr).await?;
//! let sum = connection.call_method("calculator.add", vec![json!(2), json!(3)]).await?;
//! assert_eq!(sum, Some(json!(5)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol Overview
//!
//! Packets travel as newline-delimited JSON tuples:
//!
//! `[kind, index, ...payload]`
//!
//! - **kind**: the packet kind tag (see the table below)
//! - **index**: per-connection monotonically increasing integer that
//!   correlates a CALL with its CALLBACK; `0` is reserved for the
//!   handshake exchange
//! - **payload**: kind-dependent fields
//!
//! ## Packet Kinds
//!
//! | Tag         | Direction       | Description                          |
//! |-------------|-----------------|--------------------------------------|
//! | `handshake` | Client → Server | Start or resume a session            |
//! | `ack`       | Server → Client | Handshake accept or reject           |
//! | `call`      | Both            | Remote method call                   |
//! | `callback`  | Both            | Reply to a call, same index          |
//! | `event`     | Both            | Notification, no reply expected      |
//! | `inspect`   | Both            | Interface introspection request      |
//! | `ping`      | Both            | Keepalive request                    |
//! | `pong`      | Both            | Keepalive response                   |
//!
//! ## Sessions and call replay
//!
//! A session outlives any single transport. Calls issued through
//! [`Connection::call_method_with_resend`] survive a transport drop:
//! they migrate to the session's pending queue and are replayed, in
//! original submission order, over the next connection that resumes
//! the session. Replay is at-least-once; the remote side may execute a
//! call twice when only its callback was lost in transit.

pub mod application;
pub mod codec;
pub mod connection;
pub mod packet;
pub mod session;
pub mod tcp;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use application::{Application, ApplicationRegistry, Interface, MethodResult};
pub use codec::{Frame, JstpPacketCodec};
pub use connection::{Connection, RemoteEvent};
pub use packet::{decode_packet, encode_packet, Packet, PacketKind};
pub use session::{AllowAllAuth, AuthProvider, CallOutcome, Session, SessionManager};
pub use tcp::{JstpServer, ServerConfig, ServerEvent, ServerHandle};
pub use transport::Transport;
pub use types::{
    ConnectionId, JstpError, RemoteError, SessionId, HANDSHAKE_INDEX, HANDSHAKE_TIMEOUT,
};
