//! Cooperative listener
//!
//! One task accepts; every accepted peer gets its own local task running the
//! transport setup, the upgrade handshake and then the handler. Everything
//! runs on the caller's thread inside a `LocalSet` owned by the serve call,
//! so it works from a plain current-thread runtime.
//!
//! Shutdown is one `watch` channel: every server connection observes it in
//! `recv()` and closes itself with 1001.

use crate::connection::Connection;
use crate::handler::Handler;
use crate::handshake::negotiate_server_until;
use crate::registry::{ConnectionId, Registry};
use crate::transport::{Acceptor, TcpAcceptor};
use knsock_core::config::{Config, ListenerConfig};
use knsock_core::error::{ConfigError, Error, Result, TimeoutError};
use knsock_core::protocol::CloseCode;
use knsock_core::session::Role;
use std::future::{self, Future};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet, LocalSet};

/// Close reason sent to every connection still open at shutdown
pub const SHUTDOWN_REASON: &str = "server shutdown";

/// What a handler gets besides its connection
#[derive(Debug, Clone)]
pub struct Context {
    id: ConnectionId,
    registry: Registry,
}

impl Context {
    /// This connection's id in the registry
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// All connections served by the listener
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Builder for [`Listener`]
#[derive(Debug, Clone, Default)]
pub struct ListenerBuilder {
    config: ListenerConfig,
}

impl ListenerBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to the given address
    pub fn bind<A: ToSocketAddrs>(mut self, addr: A) -> Result<Self> {
        self.config.bind_address = addr.to_socket_addrs()?.next().ok_or_else(|| {
            Error::Config(ConfigError::Validation("Invalid bind address".to_string()))
        })?;
        Ok(self)
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set maximum concurrent connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Append a header to every handshake response
    pub fn extra_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Set the per-connection configuration
    pub fn connection_config(mut self, config: Config) -> Self {
        self.config.connection = config;
        self
    }

    /// Validate the configuration and bind a plaintext TCP listener
    pub async fn build(self) -> Result<Listener> {
        self.config.validate()?;
        let acceptor = TcpAcceptor::bind(self.config.bind_address).await?;
        Ok(Listener::new(self.config, acceptor))
    }

    /// Validate the configuration and bind a TLS listener
    #[cfg(feature = "tls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
    pub async fn build_tls(
        self,
        tls_config: rustls::ServerConfig,
    ) -> Result<Listener<crate::transport::TlsAcceptor>> {
        self.config.validate()?;
        let acceptor =
            crate::transport::TlsAcceptor::bind(self.config.bind_address, tls_config).await?;
        Ok(Listener::new(self.config, acceptor))
    }

    /// Validate the configuration and serve from a caller-supplied acceptor
    ///
    /// The configured bind address is ignored.
    pub fn build_with<A: Acceptor>(self, acceptor: A) -> Result<Listener<A>> {
        self.config.validate()?;
        Ok(Listener::new(self.config, acceptor))
    }
}

/// Cooperative WebSocket listener
#[derive(Debug)]
pub struct Listener<A: Acceptor = TcpAcceptor> {
    config: Rc<ListenerConfig>,
    acceptor: Rc<A>,
    registry: Registry,
}

impl Listener {
    /// Create a listener builder
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::new()
    }
}

impl<A: Acceptor> Listener<A> {
    fn new(config: ListenerConfig, acceptor: A) -> Self {
        Self {
            config: Rc::new(config),
            acceptor: Rc::new(acceptor),
            registry: Registry::new(),
        }
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.acceptor.local_addr()?)
    }

    /// Get the listener configuration
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Registry of connections served by this listener
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Accept peers forever
    pub async fn serve<H>(self, handler: H) -> Result<()>
    where
        H: Handler<A::Stream>,
    {
        self.serve_with_shutdown(handler, future::pending()).await
    }

    /// Accept peers until `signal` completes
    ///
    /// Peers whose handshake fails never reach the handler. A handler
    /// returning without closing its connection gets a normal close. Once
    /// `signal` fires the accept loop stops, every connection closes with
    /// 1001 at its next `recv()`, and in-flight tasks get up to the close
    /// timeout before they are cancelled.
    #[cfg_attr(feature = "logging", tracing::instrument(skip_all))]
    pub async fn serve_with_shutdown<H, F>(self, handler: H, signal: F) -> Result<()>
    where
        H: Handler<A::Stream>,
        F: Future<Output = ()>,
    {
        let local = LocalSet::new();
        local.run_until(self.run(Rc::new(handler), signal)).await
    }

    async fn run<H, F>(self, handler: Rc<H>, signal: F) -> Result<()>
    where
        H: Handler<A::Stream>,
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tokio::pin!(signal);
        tracing::info!(addr = ?self.acceptor.local_addr().ok(), "listening");

        loop {
            let event = tokio::select! {
                _ = &mut signal => Event::Shutdown,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => Event::Finished(joined),
                accepted = self.acceptor.accept() => Event::Accepted(accepted),
            };

            match event {
                Event::Shutdown => break,
                Event::Finished(Ok(())) => {}
                Event::Finished(Err(err)) => {
                    tracing::error!(error = %err, "connection task failed");
                }
                Event::Accepted(Ok((stream, peer))) => {
                    if tasks.len() >= self.config.max_connections {
                        tracing::warn!(%peer, "connection limit reached, rejecting connection");
                        continue;
                    }
                    tracing::debug!(%peer, "accepted");
                    tasks.spawn_local(run_connection(
                        Rc::clone(&self.acceptor),
                        stream,
                        peer,
                        Rc::clone(&self.config),
                        self.registry.clone(),
                        shutdown_rx.clone(),
                        Rc::clone(&handler),
                    ));
                }
                Event::Accepted(Err(err)) => {
                    tracing::error!(error = %err, "accept failed");
                    tokio::time::sleep(self.config.accept_poll_interval).await;
                }
            }
        }

        tracing::info!(connections = self.registry.len(), "shutting down");
        shutdown_tx.send_replace(true);

        let close_timeout = self.config.connection.close_timeout;
        let drained = tokio::time::timeout(close_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "cancelling connections after shutdown");
            tasks.shutdown().await;
        }

        Ok(())
    }
}

enum Event {
    Shutdown,
    Finished(std::result::Result<(), JoinError>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
}

/// Removes the registry entry even if the task is cancelled
struct Registration {
    registry: Registry,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

async fn run_connection<A, H>(
    acceptor: Rc<A>,
    stream: TcpStream,
    peer: SocketAddr,
    config: Rc<ListenerConfig>,
    registry: Registry,
    shutdown: watch::Receiver<bool>,
    handler: Rc<H>,
) where
    A: Acceptor,
    H: Handler<A::Stream>,
{
    let conn = match establish(&*acceptor, stream, peer, &config, shutdown.clone()).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::debug!(%peer, error = %err, "handshake failed");
            return;
        }
    };

    let registration = Registration {
        id: registry.register(Some(peer), conn.resource()),
        registry,
    };
    let id = registration.id;
    tracing::info!(%peer, id, resource = conn.resource(), "connection established");

    // Shutdown may have been broadcast while the handshake was running
    if *shutdown.borrow() {
        let _ = conn.close(CloseCode::Away, SHUTDOWN_REASON).await;
        return;
    }

    let ctx = Context {
        id,
        registry: registration.registry.clone(),
    };
    match handler.handle(conn.clone(), ctx).await {
        Ok(()) => {}
        Err(err) if err.is_closed() => tracing::debug!(%peer, id, "peer closed connection"),
        Err(err) => tracing::warn!(%peer, id, error = %err, "handler failed"),
    }

    drop(registration);
    if !conn.is_closed() {
        let _ = conn.close(CloseCode::Normal, "").await;
    }
    tracing::debug!(%peer, id, "connection finished");
}

async fn establish<A: Acceptor>(
    acceptor: &A,
    stream: TcpStream,
    peer: SocketAddr,
    config: &ListenerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Connection<A::Stream>> {
    let timeout = config.handshake_timeout;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut stream = match tokio::time::timeout_at(deadline, acceptor.wrap(stream)).await {
        Ok(wrapped) => wrapped?,
        Err(_) => return Err(TimeoutError::Handshake { timeout }.into()),
    };

    let (info, leftover) = negotiate_server_until(&mut stream, config, deadline).await?;
    Connection::new(
        stream,
        Role::Server,
        config.connection.clone(),
        info,
        leftover,
        Some(peer),
        Some(shutdown),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connect;
    use crate::handler::{from_fn, EchoHandler};
    use knsock_core::config::ClientConfig;
    use knsock_core::message::Message;
    use std::cell::Cell;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn test_listener() -> Listener {
        Listener::builder()
            .bind("127.0.0.1:0")
            .unwrap()
            .handshake_timeout(Duration::from_millis(500))
            .connection_config(Config::default().close_timeout(Duration::from_millis(500)))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo_and_shutdown() {
        let listener = test_listener().await;
        let addr = listener.local_addr().unwrap().to_string();
        let registry = listener.registry();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = listener.serve_with_shutdown(EchoHandler::new(), async {
            let _ = stop_rx.await;
        });
        let client = async {
            let conn = connect(&addr, ClientConfig::default()).await.unwrap();
            conn.send("hi").await.unwrap();
            assert_eq!(conn.recv().await.unwrap(), Message::text("Echo: hi"));
            assert_eq!(registry.len(), 1);

            stop_tx.send(()).unwrap();
            conn.recv().await
        };

        let (served, result) = tokio::join!(server, client);
        served.unwrap();
        match result {
            Err(Error::ConnectionClosed(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Away);
                assert_eq!(frame.reason, SHUTDOWN_REASON);
            }
            other => panic!("expected shutdown close, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_handshake_skips_handler() {
        let listener = test_listener().await;
        let addr = listener.local_addr().unwrap();
        let calls = Rc::new(Cell::new(0));
        let counted = Rc::clone(&calls);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handler = from_fn(move |conn: Connection, _ctx: Context| {
            counted.set(counted.get() + 1);
            async move {
                conn.close(CloseCode::Normal, "").await?;
                Ok::<_, Error>(())
            }
        });
        let server = listener.serve_with_shutdown(handler, async {
            let _ = stop_rx.await;
        });
        let client = async {
            let mut raw = TcpStream::connect(addr).await.unwrap();
            raw.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            let mut response = String::new();
            raw.read_to_string(&mut response).await.unwrap();
            stop_tx.send(()).unwrap();
            response
        };

        let (served, response) = tokio::join!(server, client);
        served.unwrap();
        assert!(response.starts_with("HTTP/1.1 400"));
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test]
    async fn test_handler_sees_registry_and_gets_normal_close() {
        let listener = test_listener().await;
        let addr = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handler = from_fn(|conn: Connection, ctx: Context| async move {
            let message = conn.recv().await?;
            let known = ctx.registry().ids().contains(&ctx.id());
            let peer_known = ctx.registry().get(ctx.id()).map(|entry| entry.peer_addr);
            conn.send_text(format!(
                "{} {} {}",
                message.as_text().unwrap_or_default(),
                known,
                peer_known == Some(conn.peer_addr())
            ))
            .await?;
            Ok::<_, Error>(())
        });
        let server = listener.serve_with_shutdown(handler, async {
            let _ = stop_rx.await;
        });
        let client = async {
            let conn = connect(&addr, ClientConfig::default()).await.unwrap();
            conn.send("registered").await.unwrap();
            let reply = conn.recv().await.unwrap();
            let closed = conn.recv().await;
            stop_tx.send(()).unwrap();
            (reply, closed)
        };

        let (served, (reply, closed)) = tokio::join!(server, client);
        served.unwrap();
        assert_eq!(reply, Message::text("registered true true"));
        match closed {
            Err(Error::ConnectionClosed(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected normal close, got {:?}", other),
        }
    }

    /// Spends most of the handshake budget setting up the transport
    struct SlowAcceptor {
        inner: TcpAcceptor,
        delay: Duration,
    }

    #[async_trait::async_trait(?Send)]
    impl Acceptor for SlowAcceptor {
        type Stream = TcpStream;

        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.inner.accept().await
        }

        async fn wrap(&self, stream: TcpStream) -> io::Result<TcpStream> {
            tokio::time::sleep(self.delay).await;
            Ok(stream)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[tokio::test]
    async fn test_transport_setup_and_upgrade_share_one_timeout() {
        let acceptor = SlowAcceptor {
            inner: TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
            delay: Duration::from_millis(400),
        };
        let addr = acceptor.local_addr().unwrap();
        let config = ListenerConfig {
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // The peer connects and never sends a request
        let _silent = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = acceptor.accept().await.unwrap();

        let started = tokio::time::Instant::now();
        let result = establish(&acceptor, stream, peer, &config, shutdown_rx).await;
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(Error::Timeout(TimeoutError::Handshake { .. }))
        ));
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_builder_validates() {
        let result = Listener::builder()
            .bind("127.0.0.1:0")
            .unwrap()
            .max_connections(0)
            .build()
            .await;
        assert!(matches!(result, Err(Error::Config(_))));

        let result = Listener::builder()
            .bind("127.0.0.1:0")
            .unwrap()
            .extra_header("bad header", "x")
            .build()
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
