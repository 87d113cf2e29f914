//! Echo Server Example
//!
//! Cooperative echo server on `ws://127.0.0.1:8765`. Every text message is
//! answered with `Echo: <text>`; Ctrl-C closes open connections with 1001
//! and exits.

use knsock::cooperative::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let listener = Listener::builder()
        .bind("127.0.0.1:8765")?
        .max_connections(1000)
        .build()
        .await?;

    println!("Echo server listening on ws://{}", listener.local_addr()?);

    let handler = from_fn(|conn: Connection, ctx: Context| async move {
        println!("Connection {} from {:?}", ctx.id(), conn.peer_addr());
        loop {
            match conn.recv().await {
                Ok(Message::Text(text)) => conn.send_text(format!("Echo: {}", text)).await?,
                Ok(Message::Binary(data)) => conn.send_binary(data).await?,
                Err(err) if err.is_closed() => {
                    println!("Connection {} closed: {:?}", ctx.id(), conn.close_frame());
                    return Ok::<_, Error>(());
                }
                Err(err) => return Err(err),
            }
        }
    });

    listener
        .serve_with_shutdown(handler, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
