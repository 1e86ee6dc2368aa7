//! Sessions: the logical identity that outlives any single transport.
//!
//! A session holds the opaque token issued at handshake, the
//! authenticated principal (if any) and the queue of resendable calls
//! that have not yet been acknowledged by a CALLBACK. When a transport
//! drops, the bound connection migrates its resendable in-flight calls
//! here; the next connection that rebinds the session replays them in
//! original submission order. This is at-least-once delivery: the
//! remote side may execute a replayed call twice if only the CALLBACK
//! was lost. That tradeoff is part of the protocol, not corrected here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::application::Application;
use crate::types::{ConnectionId, JstpError, SessionId};

/// What the issuer of a call eventually receives.
pub type CallOutcome = Result<Option<Value>, JstpError>;

/// One call issued but not yet acknowledged by a CALLBACK.
pub struct PendingCall {
    pub method: String,
    pub args: Vec<Value>,
    pub reply: oneshot::Sender<CallOutcome>,
    pub resend: bool,
    pub attempts: u32,
    pub issued_at: Instant,
}

impl PendingCall {
    pub fn new(
        method: String,
        args: Vec<Value>,
        reply: oneshot::Sender<CallOutcome>,
        resend: bool,
    ) -> Self {
        Self {
            method,
            args,
            reply,
            resend,
            attempts: 0,
            issued_at: Instant::now(),
        }
    }
}

struct SessionState {
    principal: Option<String>,
    /// Resendable calls awaiting replay, original submission order.
    pending: VecDeque<PendingCall>,
    /// The one connection currently bound, if the transport is up.
    bound: Option<ConnectionId>,
}

/// Shared handle to one session.
///
/// At most one connection is bound at any instant; rebinding evicts the
/// prior binding without discarding the pending queue. The queue is
/// only ever mutated by the currently bound connection, the mutex
/// exists for the hand-off between connection instances.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new(id: SessionId, principal: Option<String>) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(SessionState {
                principal,
                pending: VecDeque::new(),
                bound: None,
            })),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn principal(&self) -> Option<String> {
        self.state.lock().unwrap().principal.clone()
    }

    /// Bind a connection, evicting any prior binding.
    pub fn bind(&self, connection: ConnectionId) -> Option<ConnectionId> {
        let mut state = self.state.lock().unwrap();
        let evicted = state.bound.take();
        state.bound = Some(connection);
        if let Some(prior) = evicted {
            debug!(session = %self.id, prior, connection, "session rebound");
        }
        evicted
    }

    /// Unbind, but only if `connection` still owns the binding. A stale
    /// connection closing after a rebind must not disturb the new one.
    pub fn unbind(&self, connection: ConnectionId) {
        let mut state = self.state.lock().unwrap();
        if state.bound == Some(connection) {
            state.bound = None;
        }
    }

    pub fn bound_connection(&self) -> Option<ConnectionId> {
        self.state.lock().unwrap().bound
    }

    /// Queue a resendable call for replay after the next rebind.
    pub fn enqueue_pending(&self, call: PendingCall) {
        self.state.lock().unwrap().pending.push_back(call);
    }

    /// Take the whole replay queue, preserving submission order.
    pub fn drain_pending(&self) -> Vec<PendingCall> {
        self.state.lock().unwrap().pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

/// Generates and resolves session tokens. Owned by the server; dropped
/// with it, so sessions never persist across process restarts.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh session with a random opaque token.
    pub fn issue(&self, principal: Option<String>) -> Session {
        let id = SessionId(random_token());
        let session = Session::new(id.clone(), principal);
        self.sessions
            .lock()
            .unwrap()
            .insert(id.0.clone(), session.clone());
        session
    }

    /// Look up a session by token for resumption.
    pub fn resume(&self, id: &SessionId) -> Result<Session, JstpError> {
        self.sessions
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or(JstpError::UnknownSession)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Admission policy for handshakes. Decides whether a connection may
/// start a session and which principal it runs as.
pub trait AuthProvider: Send + Sync {
    fn start_authenticated_session(
        &self,
        connection: ConnectionId,
        application: &Application,
        username: &str,
        password: &str,
    ) -> BoxFuture<'static, Result<Option<String>, JstpError>>;

    fn start_anonymous_session(
        &self,
        connection: ConnectionId,
        application: &Application,
    ) -> BoxFuture<'static, Result<Option<String>, JstpError>>;
}

/// Default policy: anonymous handshakes are admitted, credentials are
/// accepted verbatim with the username as principal.
pub struct AllowAllAuth;

impl AuthProvider for AllowAllAuth {
    fn start_authenticated_session(
        &self,
        _connection: ConnectionId,
        _application: &Application,
        username: &str,
        _password: &str,
    ) -> BoxFuture<'static, Result<Option<String>, JstpError>> {
        let principal = username.to_owned();
        Box::pin(async move { Ok(Some(principal)) })
    }

    fn start_anonymous_session(
        &self,
        _connection: ConnectionId,
        _application: &Application,
    ) -> BoxFuture<'static, Result<Option<String>, JstpError>> {
        Box::pin(async { Ok(None) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(method: &str) -> (PendingCall, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingCall::new(method.to_owned(), vec![json!(1)], tx, true),
            rx,
        )
    }

    #[test]
    fn issue_then_resume() {
        let manager = SessionManager::new();
        let session = manager.issue(None);
        let resumed = manager.resume(session.id()).unwrap();
        assert_eq!(resumed.id(), session.id());
    }

    #[test]
    fn unknown_session_is_rejected() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.resume(&SessionId::from("no-such-token")),
            Err(JstpError::UnknownSession)
        ));
    }

    #[test]
    fn tokens_are_opaque_and_distinct() {
        let manager = SessionManager::new();
        let a = manager.issue(None);
        let b = manager.issue(None);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().as_str().len(), 32);
    }

    #[test]
    fn rebind_evicts_prior_binding() {
        let session = Session::new(SessionId::from("tok"), None);
        assert_eq!(session.bind(1), None);
        assert_eq!(session.bind(2), Some(1));
        assert_eq!(session.bound_connection(), Some(2));

        // A stale connection must not clear the new binding.
        session.unbind(1);
        assert_eq!(session.bound_connection(), Some(2));
        session.unbind(2);
        assert_eq!(session.bound_connection(), None);
    }

    #[test]
    fn pending_queue_preserves_submission_order() {
        let session = Session::new(SessionId::from("tok"), None);
        let (a, _rx_a) = pending("calculator.first");
        let (b, _rx_b) = pending("calculator.second");
        session.enqueue_pending(a);
        session.enqueue_pending(b);

        let drained = session.drain_pending();
        let methods: Vec<&str> = drained.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods, vec!["calculator.first", "calculator.second"]);
        assert_eq!(session.pending_len(), 0);
    }
}
