//! # knsock core
//!
//! The pure protocol half of knsock. Nothing in this crate performs I/O; the
//! blocking and cooperative adapters feed it bytes and write out what it
//! returns. It includes:
//!
//! - Error handling and types
//! - WebSocket frame encoding and decoding
//! - The upgrade handshake negotiator
//! - Message reassembly and close payloads
//! - The connection state machine
//! - Protocol constants and configuration

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![doc(html_root_url = "https://docs.rs/knsock-core/")]

// Core modules
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod session;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use config::{ClientConfig, Config, ListenerConfig};
pub use error::{Error, Result};
pub use frame::Frame;
pub use handshake::{HandshakeInfo, HandshakeRequest, HandshakeResponse, Headers};
pub use message::{CloseFrame, Message};
pub use protocol::{CloseCode, Opcode};
pub use session::{Action, Role, Session, State};
