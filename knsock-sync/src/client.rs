//! Blocking client connect

use crate::connection::Connection;
use crate::handshake::client_handshake;
use knsock_core::config::ClientConfig;
use knsock_core::error::{ConfigError, Error, Result};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};

/// Open a TCP connection to `addr` and run the client handshake
///
/// `addr` is a `host:port` string; it is sent verbatim as the Host header.
/// Each resolved address is tried in turn, bounded by the handshake timeout.
pub fn connect(addr: &str, config: ClientConfig) -> Result<Connection<TcpStream>> {
    config.validate()?;

    let addrs = addr.to_socket_addrs().map_err(|_| ConfigError::InvalidValue {
        field: "address",
        value: addr.to_string(),
    })?;

    let mut last_err = None;
    for socket_addr in addrs {
        match TcpStream::connect_timeout(&socket_addr, config.handshake_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%socket_addr, resource = %config.resource, "connected");
                return client_handshake(stream, addr, &config);
            }
            Err(err) => {
                tracing::debug!(%socket_addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }

    Err(Error::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr))
    })))
}
