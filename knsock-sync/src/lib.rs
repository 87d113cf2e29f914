//! # knsock sync
//!
//! Blocking, thread-per-connection WebSocket adapter. Every connection is
//! served by its own worker thread with blocking reads and writes; the only
//! state shared between workers is the listener's [`Registry`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use knsock_sync::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let listener = Listener::builder().bind("127.0.0.1:8765")?.build()?;
//!
//!     listener.serve(|conn, _ctx| loop {
//!         let message = conn.recv()?;
//!         if let Some(text) = message.as_text() {
//!             conn.send_text(format!("Echo: {}", text))?;
//!         }
//!     })
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/knsock-sync/")]

pub mod client;
pub mod connection;
pub mod handshake;
pub mod listener;
pub mod registry;
pub mod transport;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use client::connect;
pub use connection::Connection;
pub use handshake::{client_handshake, server_handshake};
pub use listener::{Context, Listener, ListenerBuilder, ShutdownHandle};
pub use registry::{ConnectionId, Registry};
pub use transport::Transport;
