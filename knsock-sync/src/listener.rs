//! Thread-per-connection listener
//!
//! The accept loop runs on the thread that calls [`Listener::serve`]. Every
//! accepted peer gets its own worker thread, which runs the handshake under
//! the handshake timeout and then the handler with blocking I/O. The accept
//! socket is non-blocking and polled, so a [`ShutdownHandle`] can stop the
//! loop without waking it through the network.

use crate::connection::Connection;
use crate::handshake::server_handshake;
use crate::registry::{ConnectionId, Registry};
use knsock_core::config::{Config, ListenerConfig};
use knsock_core::error::{ConfigError, Error, Result};
use knsock_core::protocol::CloseCode;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Close reason sent to every connection still open at shutdown
pub const SHUTDOWN_REASON: &str = "server shutdown";

/// Stops a running [`Listener`] from any thread
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Ask the accept loop to stop and close in-flight connections
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a handler gets besides its connection
#[derive(Debug, Clone)]
pub struct Context {
    id: ConnectionId,
    registry: Arc<Registry>,
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

    /// Set how often the accept loop checks for shutdown
    pub fn accept_poll_interval(mut self, interval: Duration) -> Self {
        self.config.accept_poll_interval = interval;
        self
    }

    /// Set the per-connection configuration
    pub fn connection_config(mut self, config: Config) -> Self {
        self.config.connection = config;
        self
    }

    /// Validate the configuration and bind the socket
    pub fn build(self) -> Result<Listener> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_address)?;
        listener.set_nonblocking(true)?;

        Ok(Listener {
            config: Arc::new(self.config),
            listener,
            registry: Arc::new(Registry::new()),
            shutdown: ShutdownHandle::default(),
        })
    }
}

/// Blocking WebSocket listener
#[derive(Debug)]
pub struct Listener {
    config: Arc<ListenerConfig>,
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: ShutdownHandle,
}

impl Listener {
    /// Create a listener builder
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::new()
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops [`Listener::serve`]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Registry of connections served by this listener
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept peers until shutdown, running `handler` on a thread per
    /// connection
    ///
    /// Peers whose handshake fails are dropped without reaching the handler.
    /// A handler returning without closing its connection gets a normal
    /// close. On shutdown every registered connection is closed with 1001
    /// and workers get up to the close timeout to finish.
    pub fn serve<H>(self, handler: H) -> Result<()>
    where
        H: Fn(Connection, Context) -> Result<()> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        tracing::info!(addr = ?self.listener.local_addr().ok(), "listening");

        while !self.shutdown.is_shutdown() {
            workers.retain(|worker| !worker.is_finished());

            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll_interval);
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    thread::sleep(self.config.accept_poll_interval);
                    continue;
                }
            };

            if workers.len() >= self.config.max_connections {
                tracing::warn!(%peer, "connection limit reached, rejecting connection");
                continue;
            }

            match self.spawn_worker(stream, peer, Arc::clone(&handler)) {
                Ok(worker) => workers.push(worker),
                Err(err) => tracing::error!(%peer, error = %err, "failed to spawn worker"),
            }
        }

        self.drain(workers);
        Ok(())
    }

    fn spawn_worker<H>(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<H>,
    ) -> io::Result<JoinHandle<()>>
    where
        H: Fn(Connection, Context) -> Result<()> + Send + Sync + 'static,
    {
        // Accepted sockets may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "accepted");

        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();

        thread::Builder::new()
            .name(format!("knsock-conn-{}", peer))
            .spawn(move || run_connection(stream, peer, &config, registry, &shutdown, &*handler))
    }

    /// Close every registered connection and wait for workers
    fn drain(&self, mut workers: Vec<JoinHandle<()>>) {
        tracing::info!(connections = self.registry.len(), "shutting down");
        self.registry.close_all(CloseCode::Away, SHUTDOWN_REASON);

        let deadline = Instant::now() + self.config.connection.close_timeout;
        loop {
            workers.retain(|worker| !worker.is_finished());
            if workers.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.config.accept_poll_interval);
        }

        if !workers.is_empty() {
            tracing::warn!(remaining = workers.len(), "workers still running after shutdown");
        }
    }
}

/// Removes the registry entry even if the handler panics
struct Registration {
    registry: Arc<Registry>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

fn run_connection<H>(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ListenerConfig,
    registry: Arc<Registry>,
    shutdown: &ShutdownHandle,
    handler: &H,
) where
    H: Fn(Connection, Context) -> Result<()>,
{
    let conn = match server_handshake(stream, config) {
        Ok(conn) => conn,
        Err(err) => {
            tracing::debug!(%peer, error = %err, "handshake failed");
            return;
        }
    };

    let registration = Registration {
        id: registry.register(&conn),
        registry,
    };
    let id = registration.id;
    tracing::info!(%peer, id, resource = conn.resource(), "connection established");

    // Shutdown may have snapshotted the registry before this registration
    if shutdown.is_shutdown() {
        let _ = conn.close(CloseCode::Away, SHUTDOWN_REASON);
        return;
    }

    let ctx = Context {
        id,
        registry: Arc::clone(&registration.registry),
    };
    match handler(conn.clone(), ctx) {
        Ok(()) => {}
        Err(err) if err.is_closed() => tracing::debug!(%peer, id, "peer closed connection"),
        Err(err) => tracing::warn!(%peer, id, error = %err, "handler failed"),
    }

    drop(registration);
    if !conn.is_closed() {
        let _ = conn.close(CloseCode::Normal, "");
    }
    tracing::debug!(%peer, id, "connection finished");
}
