//! # knsock
//!
//! RFC 6455 WebSocket engine with two execution models over one protocol
//! core:
//!
//! - [`sync`]: blocking I/O, one worker thread per connection
//! - [`cooperative`]: tokio tasks on a single thread inside a `LocalSet`
//!
//! Both share the frame codec, the handshake negotiator and the connection
//! state machine from `knsock-core`, re-exported at the crate root.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use knsock::cooperative::{EchoHandler, Listener};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> knsock::Result<()> {
//!     let listener = Listener::builder().bind("127.0.0.1:8765")?.build().await?;
//!     listener.serve(EchoHandler::new()).await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/knsock/")]

// Re-export core components
pub use knsock_core::*;

/// Blocking, thread-per-connection adapter
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub use knsock_sync as sync;

/// Cooperative single-threaded adapter
#[cfg(feature = "async")]
#[cfg_attr(docsrs, doc(cfg(feature = "async")))]
pub use knsock_async as cooperative;

#[cfg(test)]
mod tests {
    #[test]
    fn test_library_compiles() {
        assert_eq!(env!("CARGO_PKG_NAME"), "knsock");
    }
}
