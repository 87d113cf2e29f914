//! Prelude module for knsock core
//!
//! Re-exports the types most code built on the engine needs.

pub use crate::config::{ClientConfig, Config, ListenerConfig};
pub use crate::error::{Error, Result};
pub use crate::message::{CloseFrame, Message};
pub use crate::protocol::{CloseCode, Opcode};
pub use crate::session::{Role, State};

// Re-export commonly used external dependencies
pub use bytes::{Bytes, BytesMut};
