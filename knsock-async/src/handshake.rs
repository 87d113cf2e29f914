//! Cooperative handshake driver
//!
//! The whole upgrade exchange runs under one deadline, so a silent peer
//! costs its own task nothing but a timer.

use crate::connection::Connection;
use bytes::{Buf, BytesMut};
use knsock_core::config::{ClientConfig, ListenerConfig};
use knsock_core::error::{Error, HandshakeError, Result, TimeoutError};
use knsock_core::handshake::{generate_key, HandshakeInfo, HandshakeRequest, HandshakeResponse};
use knsock_core::metrics;
use knsock_core::protocol::constants::READ_CHUNK_SIZE;
use knsock_core::session::Role;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HeadParser<R> = fn(&[u8]) -> Result<Option<(R, usize)>>;

/// Answer an upgrade request and wrap the stream in a server connection
#[cfg_attr(feature = "logging", tracing::instrument(skip(stream, config)))]
pub async fn server_handshake<S>(mut stream: S, config: &ListenerConfig) -> Result<Connection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let (info, leftover) = negotiate_server(&mut stream, config).await?;
    Connection::from_parts(stream, Role::Server, config.connection.clone(), info, leftover)
}

/// Run the client side of the upgrade over a caller-supplied stream
///
/// `host` becomes the Host header verbatim.
#[cfg_attr(feature = "logging", tracing::instrument(skip(stream, config)))]
pub async fn client_handshake<S>(
    mut stream: S,
    host: &str,
    config: &ClientConfig,
) -> Result<Connection<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let (info, leftover) = negotiate_client(&mut stream, host, config).await?;
    Connection::from_parts(stream, Role::Client, config.connection.clone(), info, leftover)
}

/// Server half of the exchange; on failure the stream is rejected and shut
/// down
pub(crate) async fn negotiate_server<S>(
    stream: &mut S,
    config: &ListenerConfig,
) -> Result<(HandshakeInfo, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = tokio::time::Instant::now() + config.handshake_timeout;
    negotiate_server_until(stream, config, deadline).await
}

/// Server half of the exchange, finishing by `deadline`
///
/// Lets the listener charge transport setup and the upgrade against one
/// handshake timeout.
pub(crate) async fn negotiate_server_until<S>(
    stream: &mut S,
    config: &ListenerConfig,
    deadline: tokio::time::Instant,
) -> Result<(HandshakeInfo, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let timeout = config.handshake_timeout;

    let exchange = async {
        let (request, leftover) = read_head(stream, HandshakeRequest::parse).await?;
        let key = request.validate()?.to_string();
        let response = HandshakeResponse::accept(&key, &config.extra_headers);
        write_head(stream, &response.to_bytes()).await?;
        Ok::<_, Error>((HandshakeInfo::from_request(request), leftover))
    };

    match tokio::time::timeout_at(deadline, exchange).await {
        Ok(Ok((info, leftover))) => {
            tracing::debug!(resource = %info.resource, "handshake accepted");
            metrics::connection_opened(started.elapsed());
            Ok((info, leftover))
        }
        Ok(Err(err)) => Err(reject_and_shutdown(stream, err).await),
        Err(_) => Err(reject_and_shutdown(stream, TimeoutError::Handshake { timeout }.into()).await),
    }
}

/// Client half of the exchange; on failure the stream is shut down without
/// writing anything
pub(crate) async fn negotiate_client<S>(
    stream: &mut S,
    host: &str,
    config: &ClientConfig,
) -> Result<(HandshakeInfo, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    config.validate()?;
    let started = Instant::now();
    let timeout = config.handshake_timeout;
    let key = generate_key();

    let exchange = async {
        let request = HandshakeRequest::client(host, &config.resource, &key, &config.extra_headers);
        write_head(stream, &request.to_bytes()).await?;
        let (response, leftover) = read_head(stream, HandshakeResponse::parse).await?;
        response.validate(&key)?;
        Ok::<_, Error>((HandshakeInfo::from_response(&config.resource, response), leftover))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok((info, leftover))) => {
            tracing::debug!(host, resource = %config.resource, "handshake completed");
            metrics::connection_opened(started.elapsed());
            Ok((info, leftover))
        }
        Ok(Err(err)) => Err(shutdown(stream, err).await),
        Err(_) => Err(shutdown(stream, TimeoutError::Handshake { timeout }.into()).await),
    }
}

async fn read_head<S, R>(stream: &mut S, parse: HeadParser<R>) -> Result<(R, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        if let Some((head, len)) = parse(&buf)? {
            buf.advance(len);
            return Ok((head, buf));
        }
        buf.reserve(READ_CHUNK_SIZE);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::UnexpectedEof.into());
        }
    }
}

async fn write_head<S>(stream: &mut S, head: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(head).await?;
    stream.flush().await?;
    Ok(())
}

/// Server side: reject when there is something to answer, then shut the
/// stream down
async fn reject_and_shutdown<S>(stream: &mut S, err: Error) -> Error
where
    S: AsyncWrite + Unpin,
{
    if let Error::Handshake(ref reason) = err {
        if *reason != HandshakeError::UnexpectedEof {
            let reject = HandshakeResponse::reject(reason).to_bytes();
            // A peer that stopped reading must not stall the task
            let _ = tokio::time::timeout(Duration::from_secs(1), write_head(stream, &reject)).await;
        }
    }
    shutdown(stream, err).await
}

/// Shut the stream down without writing anything
async fn shutdown<S>(stream: &mut S, err: Error) -> Error
where
    S: AsyncWrite + Unpin,
{
    tracing::debug!(error = %err, "handshake failed");
    let _ = stream.shutdown().await;
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tracing_test::traced_test;

    const SAMPLE_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[tokio::test]
    async fn test_server_accepts_request() {
        let (mut client, server) = duplex(4096);
        client.write_all(SAMPLE_REQUEST).await.unwrap();

        let conn = server_handshake(server, &ListenerConfig::default())
            .await
            .unwrap();
        assert_eq!(conn.resource(), "/chat");
        assert_eq!(conn.role(), Role::Server);

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[tokio::test]
    async fn test_server_rejects_wrong_version() {
        let (mut client, server) = duplex(4096);
        let request = String::from_utf8_lossy(SAMPLE_REQUEST).replace("Version: 13", "Version: 8");
        client.write_all(request.as_bytes()).await.unwrap();

        let err = server_handshake(server, &ListenerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::UnsupportedVersion(_))
        ));

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 426"));
        assert!(response.contains("Sec-WebSocket-Version: 13"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_eof_during_request_is_not_answered() {
        let (mut client, server) = duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let err = server_handshake(server, &ListenerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::UnexpectedEof)
        ));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        assert!(logs_contain("handshake failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_client, server) = duplex(4096);
        let config = ListenerConfig {
            handshake_timeout: Duration::from_secs(10),
            ..Default::default()
        };

        let err = server_handshake(server, &config).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutError::Handshake { .. })));
    }

    async fn read_request<S: AsyncRead + Unpin>(server: &mut S) {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            assert!(server.read_buf(&mut head).await.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_client_detects_accept_mismatch() {
        let (client, mut server) = duplex(4096);
        let peer = async move {
            read_request(&mut server).await;
            let bogus = HandshakeResponse::accept(&generate_key(), &[]);
            server.write_all(&bogus.to_bytes()).await.unwrap();
            let mut trailing = Vec::new();
            server.read_to_end(&mut trailing).await.unwrap();
            trailing
        };

        let config = ClientConfig::default();
        let (result, trailing) = tokio::join!(
            client_handshake(client, "localhost", &config),
            peer,
        );
        assert!(matches!(
            result,
            Err(Error::Handshake(HandshakeError::AcceptMismatch { .. }))
        ));
        // The client closes without answering the bad response
        assert!(trailing.is_empty());
    }

    #[tokio::test]
    async fn test_client_closes_silently_without_upgrade_header() {
        let (client, mut server) = duplex(4096);
        let peer = async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\n\r\n")
                .await
                .unwrap();
            let mut trailing = Vec::new();
            server.read_to_end(&mut trailing).await.unwrap();
            trailing
        };

        let config = ClientConfig::default();
        let (result, trailing) = tokio::join!(
            client_handshake(client, "localhost", &config),
            peer,
        );
        assert!(result.unwrap_err().is_handshake());
        assert!(trailing.is_empty());
    }

    #[tokio::test]
    async fn test_both_sides_agree_over_duplex() {
        let (client, server) = duplex(4096);
        let listener_config = ListenerConfig {
            extra_headers: vec![("X-Server".to_string(), "knsock".to_string())],
            ..Default::default()
        };

        let config = ClientConfig::default().resource("/echo");
        let (client, server) = tokio::join!(
            client_handshake(client, "localhost:8765", &config),
            server_handshake(server, &listener_config),
        );
        let (client, server) = (client.unwrap(), server.unwrap());

        assert_eq!(server.resource(), "/echo");
        assert_eq!(server.headers().get("host"), Some("localhost:8765"));
        assert_eq!(client.headers().get("x-server"), Some("knsock"));
        assert_eq!(client.role(), Role::Client);
    }
}
