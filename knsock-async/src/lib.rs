//! # knsock async
//!
//! Cooperative WebSocket adapter. Every connection is a task on one thread:
//! the listener runs inside a tokio `LocalSet`, connections are `Rc`
//! handles, and all I/O suspends instead of blocking.
//!
//! ## Features
//!
//! - **Single-threaded**: no `Send` bounds on handlers or connections
//! - **Graceful shutdown**: a watch channel closes every connection with 1001
//! - **TLS**: rustls-backed acceptor behind the `tls` feature
//! - **Metrics**: counters and handshake timing behind the `metrics` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use knsock_async::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let listener = Listener::builder().bind("127.0.0.1:8765")?.build().await?;
//!     listener.serve(EchoHandler::new()).await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/knsock-async/")]

pub mod client;
pub mod connection;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod transport;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use client::connect;
pub use connection::Connection;
pub use handler::{from_fn, EchoHandler, FnHandler, Handler};
pub use handshake::{client_handshake, server_handshake};
pub use listener::{Context, Listener, ListenerBuilder, SHUTDOWN_REASON};
pub use logging::init_logging;
pub use registry::{ConnectionId, Registry};
pub use transport::{Acceptor, TcpAcceptor};

#[cfg(feature = "tls")]
pub use transport::{load_server_config, TlsAcceptor};
