//! TCP server for the JSTP protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::SinkExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::application::ApplicationRegistry;
use crate::codec::{Frame, JstpPacketCodec};
use crate::connection::{self, Connection, DriverConfig, Notice};
use crate::packet::Packet;
use crate::session::{AllowAllAuth, AuthProvider, SessionManager};
use crate::transport::Transport;
use crate::types::{ConnectionId, JstpError, RemoteError, HANDSHAKE_INDEX, HANDSHAKE_TIMEOUT};

/// Notifications a running server publishes. The channel may have zero
/// or more subscribers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening,
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    HandshakeTimeout { remote_address: String },
    ConnectionError { connection: ConnectionId, message: String },
    Closed,
}

/// What a server hosts and how it admits clients.
pub struct ServerConfig {
    pub applications: ApplicationRegistry,
    pub auth: Arc<dyn AuthProvider>,
}

impl ServerConfig {
    pub fn new(applications: ApplicationRegistry) -> Self {
        Self {
            applications,
            auth: Arc::new(AllowAllAuth),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }
}

/// Established connections plus a flattened list rebuilt lazily: it is
/// invalidated on every join and leave instead of being rebuilt on
/// each membership change.
#[derive(Default)]
struct Registry {
    clients: HashMap<ConnectionId, Connection>,
    cached: Option<Vec<Connection>>,
}

impl Registry {
    fn insert(&mut self, connection: Connection) {
        self.clients.insert(connection.id(), connection);
        self.cached = None;
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.clients.remove(&id);
        if removed.is_some() {
            self.cached = None;
        }
        removed
    }

    fn clear(&mut self) {
        self.clients.clear();
        self.cached = None;
    }

    fn snapshot(&mut self) -> Vec<Connection> {
        self.cached
            .get_or_insert_with(|| self.clients.values().cloned().collect())
            .clone()
    }
}

struct Shared {
    registry: Mutex<Registry>,
    sessions: SessionManager,
    applications: ApplicationRegistry,
    auth: Arc<dyn AuthProvider>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: watch::Sender<bool>,
}

/// JSTP server bound to a TCP listener.
pub struct JstpServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl JstpServer {
    /// Bind to the specified address.
    pub async fn bind(addr: &str, config: ServerConfig) -> Result<Self, JstpError> {
        let listener = TcpListener::bind(addr).await?;
        info!("JSTP server bound to {}", addr);

        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            sessions: SessionManager::new(),
            applications: config.applications,
            auth: config.auth,
            events,
            shutdown: shutdown_tx,
        });

        Ok(Self {
            listener,
            shared,
            shutdown: shutdown_rx,
        })
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, JstpError> {
        self.listener.local_addr().map_err(JstpError::Transport)
    }

    /// Control handle usable while `run` owns the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept loop. Runs until [`ServerHandle::close`] is called.
    pub async fn run(mut self) -> Result<(), JstpError> {
        info!("JSTP server starting...");
        let _ = self.shared.events.send(ServerEvent::Listening);

        let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            info!("New connection from {}", addr);
                            let shared = self.shared.clone();
                            let notices = notices_tx.clone();
                            tokio::spawn(async move {
                                serve_handshake(socket, shared, notices).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                notice = notices_rx.recv() => {
                    // The loop keeps a sender half alive, recv never
                    // yields None here.
                    if let Some(notice) = notice {
                        self.handle_notice(notice);
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Stop accepting before tearing clients down.
        drop(self.listener);

        let clients = self.shared.registry.lock().unwrap().snapshot();
        for connection in clients {
            connection.close().await;
        }
        self.shared.registry.lock().unwrap().clear();

        info!("JSTP server closed");
        let _ = self.shared.events.send(ServerEvent::Closed);
        Ok(())
    }

    fn handle_notice(&self, notice: Notice) {
        match notice {
            Notice::Closed { connection } => {
                let removed = self.shared.registry.lock().unwrap().remove(connection);
                if removed.is_some() {
                    debug!(connection, "client disconnected");
                    let _ = self
                        .shared
                        .events
                        .send(ServerEvent::Disconnect(connection));
                }
            }
            Notice::Error {
                connection,
                message,
            } => {
                let _ = self.shared.events.send(ServerEvent::ConnectionError {
                    connection,
                    message,
                });
            }
        }
    }
}

/// Cloneable control surface over a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Subscribe to server notifications.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// All currently established connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.registry.lock().unwrap().snapshot()
    }

    /// Send an EVENT to every established client.
    pub fn broadcast(&self, name: impl Into<String>, args: Vec<Value>) {
        let name = name.into();
        for connection in self.connections() {
            if let Err(e) = connection.emit_event(name.clone(), args.clone()) {
                warn!(connection = connection.id(), %e, "broadcast skipped client");
            }
        }
    }

    /// Stop accepting and close every registered connection.
    /// Idempotent: a second close is a no-op and does not re-fire the
    /// `Closed` event.
    pub fn close(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

/// Drive one freshly accepted transport through the handshake. The
/// connection only joins the registry once the handshake succeeds; a
/// peer that stays silent past the deadline is force-closed and never
/// reaches the established state.
async fn serve_handshake(
    socket: TcpStream,
    shared: Arc<Shared>,
    notices: mpsc::UnboundedSender<Notice>,
) {
    let remote_address = socket.remote_address();
    let mut framed = Framed::new(socket, JstpPacketCodec::default());

    let first = match timeout(HANDSHAKE_TIMEOUT, framed.try_next()).await {
        Err(_elapsed) => {
            warn!(%remote_address, "handshake timed out");
            let _ = shared
                .events
                .send(ServerEvent::HandshakeTimeout { remote_address });
            return;
        }
        Ok(Err(e)) => {
            warn!(%remote_address, %e, "transport failed during handshake");
            return;
        }
        Ok(Ok(None)) => {
            debug!(%remote_address, "peer went away before handshaking");
            return;
        }
        Ok(Ok(Some(Frame::Malformed(reason)))) => {
            warn!(%remote_address, %reason, "malformed handshake");
            return;
        }
        Ok(Ok(Some(Frame::Packet(packet)))) => packet,
    };

    let Packet::Handshake {
        app,
        session,
        username,
        password,
    } = first
    else {
        warn!(%remote_address, "first packet was not a handshake");
        return;
    };

    let application = match shared.applications.get(&app) {
        Ok(application) => application,
        Err(_) => {
            reject(&mut framed, RemoteError::app_not_found(&app)).await;
            return;
        }
    };

    let connection_id = connection::next_connection_id();

    let session = match session {
        // Resume: rebind the existing session; its pending queue is
        // replayed by the driver right after it starts.
        Some(id) => match shared.sessions.resume(&id) {
            Ok(session) => session,
            Err(_) => {
                reject(&mut framed, RemoteError::session_not_found(id.as_str())).await;
                return;
            }
        },
        // Fresh handshake: admit through the auth provider.
        None => {
            let admitted = match (&username, &password) {
                (Some(username), Some(password)) => {
                    shared
                        .auth
                        .start_authenticated_session(connection_id, &application, username, password)
                        .await
                }
                _ => {
                    shared
                        .auth
                        .start_anonymous_session(connection_id, &application)
                        .await
                }
            };
            match admitted {
                Ok(principal) => shared.sessions.issue(principal),
                Err(e) => {
                    reject(&mut framed, RemoteError::auth_failed(&e.to_string())).await;
                    return;
                }
            }
        }
    };

    let ack = Packet::HandshakeAck {
        index: HANDSHAKE_INDEX,
        error: None,
        session_id: Some(session.id().clone()),
    };
    if let Err(e) = framed.send(ack).await {
        warn!(%remote_address, %e, "failed to acknowledge handshake");
        return;
    }

    info!(connection = connection_id, %remote_address, session = %session.id(), "handshake complete");

    let connection = connection::spawn(
        framed,
        DriverConfig {
            id: connection_id,
            session,
            application: Some(application),
            notices: Some(notices),
            remote_address,
        },
    );

    shared.registry.lock().unwrap().insert(connection.clone());
    let _ = shared.events.send(ServerEvent::Connect(connection_id));
}

async fn reject(framed: &mut Framed<TcpStream, JstpPacketCodec>, error: RemoteError) {
    let ack = Packet::HandshakeAck {
        index: HANDSHAKE_INDEX,
        error: Some(error),
        session_id: None,
    };
    let _ = framed.send(ack).await;
    let _ = framed.close().await;
}
