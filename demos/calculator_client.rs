use std::error::Error;
use std::time::Duration;

use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting JSTP calculator client...");

    let connection = jstp::tcp::connect("calculatorApp", None, "127.0.0.1:3228").await?;
    info!("connected, session {}", connection.session().id());

    let methods = connection.inspect("calculator").await?;
    info!("calculator exports: {:?}", methods);

    let sum = connection
        .call_method("calculator.add", vec![json!(2), json!(3)])
        .await?;
    info!("add(2, 3) = {:?}", sum);

    // A resendable call keeps its callback across a reconnect: if the
    // transport drops now, resuming the session below replays it.
    let session = connection.session().clone();
    let product = connection
        .call_method_with_resend("calculator.mul", vec![json!(6), json!(7)])
        .await?;
    info!("mul(6, 7) = {:?}", product);

    connection.close().await;

    // Resume the same session over a fresh transport.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resumed = jstp::tcp::connect("calculatorApp", Some(session), "127.0.0.1:3228").await?;
    let hi = resumed.call_method("calculator.sayHi", vec![]).await?;
    info!("after resume, sayHi() = {:?}", hi);

    resumed.close().await;
    info!("Client example completed successfully!");
    Ok(())
}
