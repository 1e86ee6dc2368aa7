//! TCP client: dials a server and performs the handshake, fresh or
//! resuming an existing session.

use std::sync::Arc;

use futures::SinkExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::info;

use crate::application::Application;
use crate::codec::{Frame, JstpPacketCodec};
use crate::connection::{self, Connection, DriverConfig};
use crate::packet::Packet;
use crate::session::Session;
use crate::transport::Transport;
use crate::types::{JstpError, SessionId, HANDSHAKE_TIMEOUT};

/// Credentials for an authenticated handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connect anonymously, starting a fresh session, or resuming the
/// given one. Yields an established connection or the handshake error
/// (auth rejection, unknown session, timeout, transport failure).
pub async fn connect(
    app_name: &str,
    session: Option<Session>,
    addr: impl ToSocketAddrs,
) -> Result<Connection, JstpError> {
    let socket = TcpStream::connect(addr).await?;
    handshake_over(socket, app_name, session, None, None).await
}

/// Connect with username/password credentials.
pub async fn connect_with_auth(
    app_name: &str,
    credentials: Credentials,
    addr: impl ToSocketAddrs,
) -> Result<Connection, JstpError> {
    let socket = TcpStream::connect(addr).await?;
    handshake_over(socket, app_name, None, Some(credentials), None).await
}

/// Perform the client side of the handshake over any transport.
///
/// `application`, when given, is exposed to the peer for server-to-
/// client calls. Resuming with a `session` that carries queued
/// resendable calls replays them before anything new is sent.
pub async fn handshake_over<T: Transport>(
    transport: T,
    app_name: &str,
    session: Option<Session>,
    credentials: Option<Credentials>,
    application: Option<Arc<Application>>,
) -> Result<Connection, JstpError> {
    let remote_address = transport.remote_address();
    let mut framed = Framed::new(transport, JstpPacketCodec::default());

    let (username, password) = match credentials {
        Some(c) => (Some(c.username), Some(c.password)),
        None => (None, None),
    };

    framed
        .send(Packet::Handshake {
            app: app_name.to_owned(),
            session: session.as_ref().map(|s| s.id().clone()),
            username,
            password,
        })
        .await?;

    let ack = match timeout(HANDSHAKE_TIMEOUT, framed.try_next()).await {
        Err(_elapsed) => return Err(JstpError::HandshakeTimeout),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(None)) => return Err(JstpError::ConnectionLost),
        Ok(Ok(Some(Frame::Malformed(reason)))) => {
            return Err(JstpError::MalformedPacket(reason));
        }
        Ok(Ok(Some(Frame::Packet(packet)))) => packet,
    };

    let (error, session_id) = match ack {
        Packet::HandshakeAck {
            error, session_id, ..
        } => (error, session_id),
        _ => {
            return Err(JstpError::MalformedPacket(
                "expected a handshake acknowledgement".to_owned(),
            ))
        }
    };

    if let Some(error) = error {
        return Err(error.into_handshake_error());
    }

    // A resumed session keeps its identity and pending queue; a fresh
    // one adopts the token the server just issued.
    let session = match session {
        Some(session) => session,
        None => {
            let id: SessionId = session_id.ok_or_else(|| {
                JstpError::MalformedPacket("handshake ack without session id".to_owned())
            })?;
            Session::new(id, None)
        }
    };

    info!(%remote_address, session = %session.id(), "handshake complete");

    Ok(connection::spawn(
        framed,
        DriverConfig {
            id: connection::next_connection_id(),
            session,
            application,
            notices: None,
            remote_address,
        },
    ))
}
