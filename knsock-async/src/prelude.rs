//! Prelude module with common imports

pub use crate::client::connect;
pub use crate::connection::Connection;
pub use crate::handler::{from_fn, EchoHandler, FnHandler, Handler};
pub use crate::listener::{Context, Listener, ListenerBuilder};
pub use crate::logging::init_logging;
pub use crate::registry::{ConnectionId, Registry};
pub use crate::transport::{Acceptor, TcpAcceptor};

#[cfg(feature = "tls")]
pub use crate::transport::{load_server_config, TlsAcceptor};

// Re-export core types
pub use knsock_core::prelude::*;
