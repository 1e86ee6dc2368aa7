//! Application registry: named interfaces exposing named methods.
//!
//! Pure lookup, no protocol logic. The registry is immutable once built
//! and read-only from the connection layer's perspective.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::types::{ConnectionId, JstpError, RemoteError};

/// Outcome of one remote method invocation, sent back in a CALLBACK.
pub type MethodResult = Result<Option<Value>, RemoteError>;

/// A remote method handler. Invoked with the id of the calling
/// connection and the decoded CALL arguments.
pub type MethodHandler =
    Arc<dyn Fn(ConnectionId, Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// A named set of methods.
#[derive(Clone, Default)]
pub struct Interface {
    methods: HashMap<String, MethodHandler>,
}

impl Interface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method handler under `name`.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ConnectionId, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = MethodResult> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |conn, args| Box::pin(handler(conn, args)));
        self.methods.insert(name.into(), handler);
        self
    }

    fn get(&self, name: &str) -> Option<&MethodHandler> {
        self.methods.get(name)
    }

    fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One application: a name plus its interfaces.
#[derive(Clone)]
pub struct Application {
    name: String,
    interfaces: HashMap<String, Interface>,
}

impl Application {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interfaces: HashMap::new(),
        }
    }

    pub fn interface(mut self, name: impl Into<String>, interface: Interface) -> Self {
        self.interfaces.insert(name.into(), interface);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by its `"interface.method"` path.
    pub fn method(&self, path: &str) -> Option<&MethodHandler> {
        let (interface, method) = path.split_once('.')?;
        self.interfaces.get(interface)?.get(method)
    }

    /// Sorted method names of an interface; serves INSPECT packets.
    pub fn inspect(&self, interface: &str) -> Option<Vec<String>> {
        self.interfaces.get(interface).map(Interface::method_names)
    }
}

/// The set of applications a server hosts, keyed by name.
#[derive(Clone, Default)]
pub struct ApplicationRegistry {
    applications: HashMap<String, Arc<Application>>,
}

impl ApplicationRegistry {
    pub fn new(applications: impl IntoIterator<Item = Application>) -> Self {
        Self {
            applications: applications
                .into_iter()
                .map(|app| (app.name().to_owned(), Arc::new(app)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Application>, JstpError> {
        self.applications
            .get(name)
            .cloned()
            .ok_or_else(|| JstpError::UnknownApplication(name.to_owned()))
    }
}
