//! Blocking Echo Server Example
//!
//! Same protocol as `echo_server`, served by one thread per connection.

use knsock::sync::prelude::*;

fn main() -> Result<()> {
    let listener = Listener::builder().bind("127.0.0.1:8765")?.build()?;
    println!("Echo server listening on ws://{}", listener.local_addr()?);

    listener.serve(|conn, _ctx| loop {
        match conn.recv()? {
            Message::Text(text) => conn.send_text(format!("Echo: {}", text))?,
            Message::Binary(data) => conn.send_binary(data)?,
        }
    })
}
