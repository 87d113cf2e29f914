//! Blocking handshake driver
//!
//! Reads the upgrade head under a deadline, answers or validates it, and
//! turns the transport into a [`Connection`]. Bytes that arrived after the
//! head stay buffered as the start of the frame stream.

use crate::connection::Connection;
use crate::transport::{is_timeout, Transport};
use bytes::{Buf, BytesMut};
use knsock_core::config::{ClientConfig, ListenerConfig};
use knsock_core::error::{Error, HandshakeError, Result, TimeoutError};
use knsock_core::handshake::{generate_key, HandshakeInfo, HandshakeRequest, HandshakeResponse};
use knsock_core::metrics;
use knsock_core::protocol::constants::READ_CHUNK_SIZE;
use knsock_core::session::Role;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

type HeadParser<R> = fn(&[u8]) -> Result<Option<(R, usize)>>;

/// Answer an upgrade request on a freshly accepted transport
///
/// On any failure the transport is shut down and no connection is created.
/// Malformed or invalid requests get a rejection response first.
pub fn server_handshake<T: Transport>(mut stream: T, config: &ListenerConfig) -> Result<Connection<T>> {
    let started = Instant::now();

    let (request, leftover) =
        match read_head(&mut stream, config.handshake_timeout, HandshakeRequest::parse) {
            Ok(head) => head,
            Err(err) => return Err(reject_and_shutdown(&mut stream, err)),
        };

    let key = match request.validate() {
        Ok(key) => key.to_string(),
        Err(err) => return Err(reject_and_shutdown(&mut stream, err)),
    };

    let response = HandshakeResponse::accept(&key, &config.extra_headers);
    if let Err(err) = write_head(&mut stream, &response.to_bytes()) {
        return Err(reject_and_shutdown(&mut stream, err.into()));
    }
    stream.set_read_timeout(None)?;

    tracing::debug!(resource = %request.resource, "handshake accepted");
    metrics::connection_opened(started.elapsed());

    Connection::from_parts(
        stream,
        Role::Server,
        config.connection.clone(),
        HandshakeInfo::from_request(request),
        leftover,
    )
}

/// Run the client side of the upgrade over a caller-supplied transport
///
/// `host` becomes the Host header verbatim, e.g. `"example.com:8765"`.
pub fn client_handshake<T: Transport>(
    mut stream: T,
    host: &str,
    config: &ClientConfig,
) -> Result<Connection<T>> {
    config.validate()?;
    let started = Instant::now();
    let key = generate_key();

    let request = HandshakeRequest::client(host, &config.resource, &key, &config.extra_headers);
    if let Err(err) = write_head(&mut stream, &request.to_bytes()) {
        return Err(shutdown(&mut stream, err.into()));
    }

    let (response, leftover) =
        match read_head(&mut stream, config.handshake_timeout, HandshakeResponse::parse) {
            Ok(head) => head,
            Err(err) => return Err(shutdown(&mut stream, err)),
        };

    if let Err(err) = response.validate(&key) {
        return Err(shutdown(&mut stream, err));
    }
    stream.set_read_timeout(None)?;

    tracing::debug!(host, resource = %config.resource, "handshake completed");
    metrics::connection_opened(started.elapsed());

    Connection::from_parts(
        stream,
        Role::Client,
        config.connection.clone(),
        HandshakeInfo::from_response(&config.resource, response),
        leftover,
    )
}

/// Read until `parse` recognizes a complete head or the deadline passes
fn read_head<T: Transport, R>(
    stream: &mut T,
    timeout: Duration,
    parse: HeadParser<R>,
) -> Result<(R, BytesMut)> {
    let deadline = Instant::now() + timeout;
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        if let Some((head, len)) = parse(&buf)? {
            buf.advance(len);
            return Ok((head, buf));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TimeoutError::Handshake { timeout }.into());
        }
        stream.set_read_timeout(Some(remaining))?;

        match stream.read(&mut chunk) {
            Ok(0) => return Err(HandshakeError::UnexpectedEof.into()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if is_timeout(&err) => {
                return Err(TimeoutError::Handshake { timeout }.into());
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn write_head<T: Transport>(stream: &mut T, head: &[u8]) -> io::Result<()> {
    stream.write_all(head)?;
    stream.flush()
}

/// Server side: reject when there is something to answer, then release the
/// transport
fn reject_and_shutdown<T: Transport>(stream: &mut T, err: Error) -> Error {
    if let Error::Handshake(ref reason) = err {
        if *reason != HandshakeError::UnexpectedEof {
            let _ = write_head(stream, &HandshakeResponse::reject(reason).to_bytes());
        }
    }
    shutdown(stream, err)
}

/// Release the transport without writing anything
fn shutdown<T: Transport>(stream: &mut T, err: Error) -> Error {
    tracing::debug!(error = %err, "handshake failed");
    let _ = stream.shutdown();
    err
}
