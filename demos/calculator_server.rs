use std::error::Error;

use jstp::{Application, ApplicationRegistry, Interface, JstpServer, ServerConfig, ServerEvent};
use serde_json::{json, Value};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting JSTP calculator server...");

    let application = Application::new("calculatorApp").interface(
        "calculator",
        Interface::new()
            .method("add", |_conn, args: Vec<Value>| async move {
                let a = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                let b = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Some(json!(a + b)))
            })
            .method("mul", |_conn, args: Vec<Value>| async move {
                let a = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                let b = args.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Some(json!(a * b)))
            })
            .method("sayHi", |_conn, _args| async move { Ok(Some(json!("hi"))) }),
    );

    let registry = ApplicationRegistry::new([application]);
    let server = JstpServer::bind("127.0.0.1:3228", ServerConfig::new(registry)).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        let mut events = handle.events();
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::Connect(id) => info!("client {} connected", id),
                ServerEvent::Disconnect(id) => info!("client {} disconnected", id),
                ServerEvent::HandshakeTimeout { remote_address } => {
                    info!("handshake timeout from {}", remote_address)
                }
                other => info!("server event: {:?}", other),
            }
        }
    });

    server.run().await?;
    Ok(())
}
