//! Handshake lifecycle: fresh sessions, rejections, the deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use jstp::{
    Application, ApplicationRegistry, AuthProvider, ConnectionId, Interface, JstpError,
    JstpServer, ServerConfig, ServerEvent,
};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

fn calculator_app() -> Application {
    Application::new("testApp").interface(
        "calculator",
        Interface::new()
            .method("add", |_conn, args: Vec<Value>| async move {
                let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                Ok(Some(json!(a + b)))
            })
            .method("sayHi", |_conn, _args| async move { Ok(Some(json!("hi"))) }),
    )
}

async fn start_server(config: ServerConfig) -> (SocketAddr, jstp::ServerHandle) {
    let server = JstpServer::bind("127.0.0.1:0", config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, handle)
}

#[tokio::test]
async fn fresh_handshake_yields_session_and_working_calls() {
    let registry = ApplicationRegistry::new([calculator_app()]);
    let (addr, _handle) = start_server(ServerConfig::new(registry)).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    assert!(connection.handshake_done());
    assert_eq!(connection.session().id().as_str().len(), 32);

    let sum = connection
        .call_method("calculator.add", vec![json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(sum, Some(json!(5)));

    let hi = connection
        .call_method("calculator.sayHi", vec![])
        .await
        .unwrap();
    assert_eq!(hi, Some(json!("hi")));
}

#[tokio::test]
async fn unknown_application_is_rejected() {
    let registry = ApplicationRegistry::new([calculator_app()]);
    let (addr, _handle) = start_server(ServerConfig::new(registry)).await;

    let result = jstp::tcp::connect("noSuchApp", None, addr).await;
    assert!(matches!(result, Err(JstpError::UnknownApplication(_))));
}

#[tokio::test]
async fn unknown_method_returns_remote_error() {
    let registry = ApplicationRegistry::new([calculator_app()]);
    let (addr, _handle) = start_server(ServerConfig::new(registry)).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    let result = connection.call_method("calculator.sub", vec![]).await;
    assert!(matches!(result, Err(JstpError::Remote(e)) if e.code == 14));
}

#[tokio::test]
async fn inspect_lists_interface_methods() {
    let registry = ApplicationRegistry::new([calculator_app()]);
    let (addr, _handle) = start_server(ServerConfig::new(registry)).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    let methods = connection.inspect("calculator").await.unwrap();
    assert_eq!(methods, vec!["add".to_owned(), "sayHi".to_owned()]);
}

#[tokio::test]
async fn silent_peer_is_force_closed_at_the_deadline() {
    let registry = ApplicationRegistry::new([calculator_app()]);
    let (addr, handle) = start_server(ServerConfig::new(registry)).await;
    let mut events = handle.events();

    let started = Instant::now();
    let mut socket = TcpStream::connect(addr).await.unwrap();

    // Say nothing; the server must hang up on its own.
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(10), socket.read(&mut buf))
        .await
        .expect("server never closed the silent connection")
        .unwrap();
    assert_eq!(read, 0, "expected a bare close, got data");
    assert!(started.elapsed() >= Duration::from_millis(2900));

    let mut saw_timeout = false;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        if matches!(event, ServerEvent::HandshakeTimeout { .. }) {
            saw_timeout = true;
            break;
        }
    }
    assert!(saw_timeout);
}

struct RejectingAuth;

impl AuthProvider for RejectingAuth {
    fn start_authenticated_session(
        &self,
        _connection: ConnectionId,
        _application: &Application,
        username: &str,
        password: &str,
    ) -> BoxFuture<'static, Result<Option<String>, JstpError>> {
        let admitted = username == "ann" && password == "secret";
        let principal = username.to_owned();
        Box::pin(async move {
            if admitted {
                Ok(Some(principal))
            } else {
                Err(JstpError::Authentication("bad credentials".to_owned()))
            }
        })
    }

    fn start_anonymous_session(
        &self,
        _connection: ConnectionId,
        _application: &Application,
    ) -> BoxFuture<'static, Result<Option<String>, JstpError>> {
        Box::pin(async { Err(JstpError::Authentication("anonymous not allowed".to_owned())) })
    }
}

#[tokio::test]
async fn auth_provider_decides_admission() {
    let registry = ApplicationRegistry::new([calculator_app()]);
    let config = ServerConfig::new(registry).with_auth(Arc::new(RejectingAuth));
    let (addr, _handle) = start_server(config).await;

    let denied = jstp::tcp::connect("testApp", None, addr).await;
    assert!(matches!(denied, Err(JstpError::Authentication(_))));

    let denied = jstp::tcp::connect_with_auth(
        "testApp",
        jstp::tcp::Credentials {
            username: "mallory".to_owned(),
            password: "guess".to_owned(),
        },
        addr,
    )
    .await;
    assert!(matches!(denied, Err(JstpError::Authentication(_))));

    let admitted = jstp::tcp::connect_with_auth(
        "testApp",
        jstp::tcp::Credentials {
            username: "ann".to_owned(),
            password: "secret".to_owned(),
        },
        addr,
    )
    .await;
    assert!(admitted.is_ok());
}
