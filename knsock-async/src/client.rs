//! Cooperative client connect

use crate::connection::Connection;
use crate::handshake::negotiate_client;
use knsock_core::config::ClientConfig;
use knsock_core::error::{ConfigError, Error, Result, TimeoutError};
use knsock_core::session::Role;
use std::io;
use tokio::net::TcpStream;

/// Open a TCP connection to `addr` and run the client handshake
///
/// `addr` is a `host:port` string; it is sent verbatim as the Host header.
/// Each resolved address is tried in turn, each attempt bounded by the
/// handshake timeout.
#[cfg_attr(feature = "logging", tracing::instrument(skip(config)))]
pub async fn connect(addr: &str, config: ClientConfig) -> Result<Connection<TcpStream>> {
    config.validate()?;
    let timeout = config.handshake_timeout;

    let addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|_| ConfigError::InvalidValue {
            field: "address",
            value: addr.to_string(),
        })?;

    let mut last_err = None;
    for socket_addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(mut stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!(%socket_addr, resource = %config.resource, "connected");
                let (info, leftover) = negotiate_client(&mut stream, addr, &config).await?;
                return Connection::new(
                    stream,
                    Role::Client,
                    config.connection.clone(),
                    info,
                    leftover,
                    Some(socket_addr),
                    None,
                );
            }
            Ok(Err(err)) => {
                tracing::debug!(%socket_addr, error = %err, "connect attempt failed");
                last_err = Some(Error::Io(err));
            }
            Err(_) => {
                tracing::debug!(%socket_addr, ?timeout, "connect attempt timed out");
                last_err = Some(TimeoutError::Handshake { timeout }.into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {}", addr),
        ))
    }))
}
