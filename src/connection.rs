//! The per-connection protocol state machine.
//!
//! A [`Connection`] handle fronts a driver task that owns the framed
//! transport. The driver assigns packet indices, correlates CALLs with
//! CALLBACKs, dispatches inbound calls to the bound application, and on
//! transport loss migrates resendable in-flight calls to the session
//! for replay by the next connection instance.
//!
//! Inbound frames are processed to completion in arrival order; there
//! is no interleaving inside one connection, which preserves per-
//! connection packet ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::application::Application;
use crate::codec::{Frame, JstpPacketCodec};
use crate::packet::Packet;
use crate::session::{CallOutcome, PendingCall, Session};
use crate::transport::Transport;
use crate::types::{ConnectionId, JstpError, RemoteError};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// An EVENT received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub name: String,
    pub args: Vec<Value>,
}

/// Lifecycle notices the driver reports upward (the server forwards
/// them as `disconnect` / `connectionError`).
#[derive(Debug)]
pub(crate) enum Notice {
    Closed { connection: ConnectionId },
    Error { connection: ConnectionId, message: String },
}

enum Command {
    Call {
        method: String,
        args: Vec<Value>,
        resend: bool,
        reply: oneshot::Sender<CallOutcome>,
    },
    Emit {
        name: String,
        args: Vec<Value>,
    },
    Inspect {
        interface: String,
        reply: oneshot::Sender<CallOutcome>,
    },
    Ping {
        reply: oneshot::Sender<CallOutcome>,
    },
    Close,
}

/// Handle to an established connection.
///
/// Cheap to clone; all clones drive the same underlying transport. The
/// handle only exists after a successful handshake.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_address: String,
    session: Session,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RemoteEvent>,
    closed: watch::Receiver<bool>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True once the handshake completed. Handles are only constructed
    /// for established connections, so this is always true; it exists
    /// for symmetry with the wire-level state machine.
    pub fn handshake_done(&self) -> bool {
        true
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// The session this connection is bound to. Keep it around to
    /// resume after a transport loss.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Call a remote method and await its CALLBACK.
    ///
    /// If the transport drops before the CALLBACK arrives the call
    /// fails with [`JstpError::ConnectionLost`]; the caller decides
    /// whether to retry.
    pub async fn call_method(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> CallOutcome {
        let (reply, rx) = oneshot::channel();
        let command = Command::Call {
            method: method.into(),
            args,
            resend: false,
            reply,
        };
        if self.commands.send(command).is_err() {
            return Err(JstpError::Closed);
        }
        rx.await.unwrap_or(Err(JstpError::ConnectionLost))
    }

    /// Call a remote method; if the transport drops before the
    /// CALLBACK arrives, the call is queued on the session and
    /// replayed over the next connection that resumes it.
    ///
    /// The returned future resolves with the eventual result, possibly
    /// delivered by a later connection instance. Delivery is
    /// at-least-once: the remote method may run twice if only the
    /// CALLBACK was lost.
    ///
    /// When reconnecting after a transport loss, await [`Connection::closed`]
    /// on the old handle before resuming the session: that is when the old
    /// driver has finished migrating outstanding calls onto the session
    /// queue, so the resumed connection replays all of them.
    pub async fn call_method_with_resend(
        &self,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> CallOutcome {
        let method = method.into();
        let (reply, rx) = oneshot::channel();
        let command = Command::Call {
            method,
            args,
            resend: true,
            reply,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            // Driver already gone: queue straight on the session so the
            // next resumption picks the call up.
            if let Command::Call {
                method,
                args,
                reply,
                ..
            } = command
            {
                self.session
                    .enqueue_pending(PendingCall::new(method, args, reply, true));
            }
        }
        rx.await.unwrap_or(Err(JstpError::ConnectionLost))
    }

    /// Send an EVENT; no reply is expected.
    pub fn emit_event(&self, name: impl Into<String>, args: Vec<Value>) -> Result<(), JstpError> {
        self.commands
            .send(Command::Emit {
                name: name.into(),
                args,
            })
            .map_err(|_| JstpError::Closed)
    }

    /// Ask the peer for the method list of an interface.
    pub async fn inspect(&self, interface: impl Into<String>) -> Result<Vec<String>, JstpError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Inspect {
                interface: interface.into(),
                reply,
            })
            .map_err(|_| JstpError::Closed)?;
        let result = rx.await.unwrap_or(Err(JstpError::ConnectionLost))?;
        let methods = result
            .as_ref()
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(methods)
    }

    /// Round-trip a PING/PONG pair.
    pub async fn ping(&self) -> Result<(), JstpError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Ping { reply })
            .map_err(|_| JstpError::Closed)?;
        rx.await.unwrap_or(Err(JstpError::ConnectionLost))?;
        Ok(())
    }

    /// Subscribe to EVENT packets from the peer. Every subscriber sees
    /// every event delivered after it subscribed.
    pub fn events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    /// Close the connection and wait for the driver to finish tearing
    /// down. Idempotent: closing an already closed connection is a
    /// no-op.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close);
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Wait until the connection is fully closed, whoever closes it.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }
}

pub(crate) struct DriverConfig {
    pub id: ConnectionId,
    pub session: Session,
    pub application: Option<Arc<Application>>,
    pub notices: Option<mpsc::UnboundedSender<Notice>>,
    pub remote_address: String,
}

/// Bind the session and spawn the driver task for an established
/// (post-handshake) transport. Returns the user-facing handle.
pub(crate) fn spawn<T: Transport>(
    framed: Framed<T, JstpPacketCodec>,
    config: DriverConfig,
) -> Connection {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(64);
    let (closed_tx, closed_rx) = watch::channel(false);

    config.session.bind(config.id);

    let handle = Connection {
        id: config.id,
        remote_address: config.remote_address,
        session: config.session.clone(),
        commands: commands_tx,
        events: events_tx.clone(),
        closed: closed_rx,
    };

    let driver = Driver {
        id: config.id,
        framed,
        application: config.application,
        session: config.session,
        next_index: 1,
        pending: HashMap::new(),
        pending_pings: HashMap::new(),
        commands: commands_rx,
        events: events_tx,
        notices: config.notices,
    };

    tokio::spawn(async move {
        let exit = driver.run(closed_tx).await;
        debug!(?exit, "connection driver finished");
    });

    handle
}

#[derive(Debug)]
enum Exit {
    /// Transport dropped underneath us; resendable calls migrate.
    Lost,
    /// Locally closed; same migration rules as a lost transport.
    Closed,
}

struct Driver<T: Transport> {
    id: ConnectionId,
    framed: Framed<T, JstpPacketCodec>,
    application: Option<Arc<Application>>,
    session: Session,
    /// Next outgoing packet index; 0 is reserved for the handshake.
    next_index: u64,
    /// Outstanding CALLs (and INSPECTs) awaiting a CALLBACK, by index.
    pending: HashMap<u64, PendingCall>,
    pending_pings: HashMap<u64, oneshot::Sender<CallOutcome>>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<RemoteEvent>,
    notices: Option<mpsc::UnboundedSender<Notice>>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self, closed_tx: watch::Sender<bool>) -> Exit {
        let exit = self.run_inner().await;
        self.teardown().await;
        let _ = closed_tx.send(true);
        exit
    }

    async fn run_inner(&mut self) -> Exit {
        // Replay calls the session carried over from a previous
        // connection, in original submission order, before anything
        // new is sent.
        for call in self.session.drain_pending() {
            debug!(connection = self.id, method = %call.method, "replaying call");
            if self.send_call(call).await.is_err() {
                return Exit::Lost;
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Close) | None => return Exit::Closed,
                        Some(command) => {
                            if self.handle_command(command).await.is_err() {
                                return Exit::Lost;
                            }
                        }
                    }
                }
                frame = self.framed.try_next() => {
                    match frame {
                        Ok(Some(Frame::Packet(packet))) => {
                            if self.handle_packet(packet).await.is_err() {
                                return Exit::Lost;
                            }
                        }
                        Ok(Some(Frame::Malformed(reason))) => {
                            // Drop the packet, report once, stay alive.
                            warn!(connection = self.id, %reason, "malformed packet dropped");
                            self.report_error(format!("malformed packet: {reason}"));
                        }
                        Ok(None) => return Exit::Lost,
                        Err(error) => {
                            warn!(connection = self.id, %error, "transport error");
                            self.report_error(error.to_string());
                            return Exit::Lost;
                        }
                    }
                }
            }
        }
    }

    fn next_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn report_error(&self, message: String) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(Notice::Error {
                connection: self.id,
                message,
            });
        }
    }

    async fn send_call(&mut self, mut call: PendingCall) -> Result<(), JstpError> {
        let index = self.next_index();
        call.attempts += 1;
        let packet = Packet::Call {
            index,
            method: call.method.clone(),
            args: call.args.clone(),
        };
        self.pending.insert(index, call);
        self.framed.send(packet).await
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), JstpError> {
        match command {
            Command::Call {
                method,
                args,
                resend,
                reply,
            } => {
                self.send_call(PendingCall::new(method, args, reply, resend))
                    .await
            }
            Command::Emit { name, args } => {
                let index = self.next_index();
                self.framed.send(Packet::Event { index, name, args }).await
            }
            Command::Inspect { interface, reply } => {
                let index = self.next_index();
                let call = PendingCall::new(format!("inspect {interface}"), Vec::new(), reply, false);
                self.pending.insert(index, call);
                self.framed.send(Packet::Inspect { index, interface }).await
            }
            Command::Ping { reply } => {
                let index = self.next_index();
                self.pending_pings.insert(index, reply);
                self.framed.send(Packet::Ping { index }).await
            }
            Command::Close => unreachable!("handled by the select loop"),
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), JstpError> {
        match packet {
            Packet::Call {
                index,
                method,
                args,
            } => self.dispatch_call(index, method, args).await,
            Packet::Callback {
                index,
                error,
                result,
            } => {
                self.resolve_callback(index, error, result);
                Ok(())
            }
            Packet::Event { name, args, .. } => {
                // No receivers is fine; events may have zero listeners.
                let _ = self.events.send(RemoteEvent { name, args });
                Ok(())
            }
            Packet::Inspect { index, interface } => {
                let reply = match self
                    .application
                    .as_ref()
                    .and_then(|app| app.inspect(&interface))
                {
                    Some(methods) => Packet::Callback {
                        index,
                        error: None,
                        result: Some(Value::from(methods)),
                    },
                    None => Packet::Callback {
                        index,
                        error: Some(RemoteError::interface_not_found(&interface)),
                        result: None,
                    },
                };
                self.framed.send(reply).await
            }
            Packet::Ping { index } => self.framed.send(Packet::Pong { index }).await,
            Packet::Pong { index } => {
                match self.pending_pings.remove(&index) {
                    Some(reply) => {
                        let _ = reply.send(Ok(None));
                    }
                    None => debug!(connection = self.id, index, "unsolicited pong"),
                }
                Ok(())
            }
            Packet::Handshake { .. } | Packet::HandshakeAck { .. } => {
                warn!(connection = self.id, "handshake packet after establishment");
                self.report_error("unexpected handshake packet".to_owned());
                Ok(())
            }
        }
    }

    async fn dispatch_call(
        &mut self,
        index: u64,
        method: String,
        args: Vec<Value>,
    ) -> Result<(), JstpError> {
        let handler = self
            .application
            .as_ref()
            .and_then(|app| app.method(&method))
            .cloned();

        let (error, result) = match handler {
            Some(handler) => match handler(self.id, args).await {
                Ok(result) => (None, result),
                Err(remote) => (Some(remote), None),
            },
            None => (Some(RemoteError::method_not_found(&method)), None),
        };

        self.framed
            .send(Packet::Callback {
                index,
                error,
                result,
            })
            .await
    }

    fn resolve_callback(&mut self, index: u64, error: Option<RemoteError>, result: Option<Value>) {
        match self.pending.remove(&index) {
            Some(call) => {
                let outcome = match error {
                    Some(remote) => Err(JstpError::Remote(remote)),
                    None => Ok(result),
                };
                let _ = call.reply.send(outcome);
            }
            None => {
                // Late or duplicate callback: drop it, report once,
                // never double-deliver to the caller.
                warn!(connection = self.id, index, "callback with no pending call");
                self.report_error(format!("unexpected callback for index {index}"));
            }
        }
    }

    async fn teardown(mut self) {
        // Commands that raced with the shutdown still deserve an
        // answer: resendable calls are queued, everything else fails.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Call {
                method,
                args,
                resend,
                reply,
            } = command
            {
                let call = PendingCall::new(method, args, reply, resend);
                self.settle(call);
            }
        }

        // Outstanding calls, in submission order (index order).
        let mut outstanding: Vec<(u64, PendingCall)> = self.pending.drain().collect();
        outstanding.sort_by_key(|(index, _)| *index);
        for (_, call) in outstanding {
            self.settle(call);
        }

        for (_, reply) in self.pending_pings.drain() {
            let _ = reply.send(Err(JstpError::ConnectionLost));
        }

        self.session.unbind(self.id);
        let _ = self.framed.close().await;

        if let Some(notices) = &self.notices {
            let _ = notices.send(Notice::Closed {
                connection: self.id,
            });
        }
    }

    fn settle(&self, call: PendingCall) {
        if call.resend {
            self.session.enqueue_pending(call);
        } else {
            let _ = call.reply.send(Err(JstpError::ConnectionLost));
        }
    }
}
