//! Prelude module with common imports

pub use crate::client::connect;
pub use crate::connection::Connection;
pub use crate::listener::{Context, Listener, ListenerBuilder, ShutdownHandle};
pub use crate::registry::{ConnectionId, Registry};
pub use crate::transport::Transport;

// Re-export core types
pub use knsock_core::prelude::*;
