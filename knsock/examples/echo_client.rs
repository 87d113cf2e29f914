//! Echo Client Example
//!
//! Connects to the echo server, sends one message, prints the reply and
//! runs the close handshake.

use knsock::cooperative::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8765".to_string());
    let conn = connect(&addr, ClientConfig::default()).await?;
    println!("Connected to ws://{}", addr);

    conn.send("hi").await?;
    let reply = conn.recv().await?;
    println!("Received: {}", reply.as_text().unwrap_or_default());

    let state = conn.close(CloseCode::Normal, "bye").await?;
    println!("Connection {}", state);

    Ok(())
}
