//! Call replay across transport interruption.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jstp::{Application, ApplicationRegistry, JstpError, JstpServer, ServerConfig};
use jstp::Interface;
use serde_json::{json, Value};

struct Recorder {
    add_invocations: AtomicUsize,
    marks: Mutex<Vec<String>>,
}

fn recording_app(recorder: Arc<Recorder>) -> Application {
    let for_add = recorder.clone();
    let for_mark = recorder;
    Application::new("testApp").interface(
        "calculator",
        Interface::new()
            .method("slowAdd", move |_conn, args: Vec<Value>| {
                let recorder = for_add.clone();
                async move {
                    recorder.add_invocations.fetch_add(1, Ordering::SeqCst);
                    // Slow enough for the caller to drop the transport
                    // before the callback goes out.
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                    let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                    Ok(Some(json!(a + b)))
                }
            })
            .method("mark", move |_conn, args: Vec<Value>| {
                let recorder = for_mark.clone();
                async move {
                    let label = args
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or("?")
                        .to_owned();
                    recorder.marks.lock().unwrap().push(label);
                    Ok(None)
                }
            })
            .method("doNothing", |_conn, _args| async move { Ok(None) }),
    )
}

async fn start_server(recorder: Arc<Recorder>) -> SocketAddr {
    let registry = ApplicationRegistry::new([recording_app(recorder)]);
    let server = JstpServer::bind("127.0.0.1:0", ServerConfig::new(registry))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn new_recorder() -> Arc<Recorder> {
    Arc::new(Recorder {
        add_invocations: AtomicUsize::new(0),
        marks: Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn resendable_call_survives_a_dropped_transport() {
    let recorder = new_recorder();
    let addr = start_server(recorder.clone()).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    let session = connection.session().clone();

    let conn = connection.clone();
    let call = tokio::spawn(async move {
        conn.call_method_with_resend("calculator.slowAdd", vec![json!(2), json!(3)])
            .await
    });

    // Let the CALL reach the server, then cut the transport before the
    // slow method replies.
    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.close().await;
    assert!(!call.is_finished());

    let reconnected = jstp::tcp::connect("testApp", Some(session), addr)
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap(), Some(json!(5)));

    // At-least-once: the method ran on the first connection and again
    // on the replay.
    assert_eq!(recorder.add_invocations.load(Ordering::SeqCst), 2);

    reconnected.close().await;
}

#[tokio::test]
async fn resendable_call_issued_after_close_is_replayed() {
    let recorder = new_recorder();
    let addr = start_server(recorder.clone()).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    let session = connection.session().clone();
    connection.close().await;

    let conn = connection.clone();
    let call = tokio::spawn(async move {
        conn.call_method_with_resend("calculator.doNothing", vec![])
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.pending_len(), 1);

    let reconnected = jstp::tcp::connect("testApp", Some(session), addr)
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.unwrap(), None);

    reconnected.close().await;
}

#[tokio::test]
async fn replay_preserves_submission_order() {
    let recorder = new_recorder();
    let addr = start_server(recorder.clone()).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    let session = connection.session().clone();
    connection.close().await;

    let mut calls = Vec::new();
    for label in ["A", "B", "C"] {
        let conn = connection.clone();
        calls.push(tokio::spawn(async move {
            conn.call_method_with_resend("calculator.mark", vec![json!(label)])
                .await
        }));
        // Sequence the submissions; order is what this test is about.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(session.pending_len(), 3);

    let reconnected = jstp::tcp::connect("testApp", Some(session), addr)
        .await
        .unwrap();

    for call in calls {
        tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    let marks = recorder.marks.lock().unwrap().clone();
    assert_eq!(marks, vec!["A", "B", "C"]);

    reconnected.close().await;
}

#[tokio::test]
async fn non_resendable_call_fails_on_transport_loss() {
    let recorder = new_recorder();
    let addr = start_server(recorder).await;

    let connection = jstp::tcp::connect("testApp", None, addr).await.unwrap();

    let conn = connection.clone();
    let call = tokio::spawn(async move {
        conn.call_method("calculator.slowAdd", vec![json!(1), json!(1)])
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.close().await;

    let outcome = call.await.unwrap();
    assert!(matches!(outcome, Err(JstpError::ConnectionLost)));
}

#[tokio::test]
async fn unknown_session_resume_falls_back_to_fresh_handshake() {
    let recorder = new_recorder();
    let addr = start_server(recorder).await;

    let stale = jstp::Session::new(jstp::SessionId::from("forgotten-token"), None);
    let denied = jstp::tcp::connect("testApp", Some(stale), addr).await;
    assert!(matches!(denied, Err(JstpError::UnknownSession)));

    // The caller's fallback: a fresh handshake.
    let fresh = jstp::tcp::connect("testApp", None, addr).await.unwrap();
    assert!(fresh.handshake_done());
    fresh.close().await;
}
