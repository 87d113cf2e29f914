//! Accept-side transports
//!
//! The listener is generic over [`Acceptor`]. Accepting is split in two so a
//! slow TLS handshake never holds up the accept loop: [`Acceptor::accept`]
//! only takes the raw TCP connection, and [`Acceptor::wrap`] runs inside the
//! connection's own task under the handshake timeout.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Source of server-side byte streams
#[async_trait(?Send)]
pub trait Acceptor: 'static {
    /// Stream handed to the WebSocket handshake
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Wait for the next TCP connection
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    /// Turn an accepted TCP connection into the handshake stream
    async fn wrap(&self, stream: TcpStream) -> io::Result<Self::Stream>;

    /// Address the acceptor is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Plaintext TCP acceptor
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to the given address
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Use an already bound listener
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }
}

#[async_trait(?Send)]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    async fn wrap(&self, stream: TcpStream) -> io::Result<TcpStream> {
        Ok(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(feature = "tls")]
pub use self::tls::{load_server_config, TlsAcceptor};

#[cfg(feature = "tls")]
mod tls {
    use super::{Acceptor, TcpAcceptor};
    use async_trait::async_trait;
    use knsock_core::error::{ConfigError, Error, Result};
    use rustls::{Certificate, PrivateKey, ServerConfig};
    use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
    use std::fmt;
    use std::fs::File;
    use std::io::{self, BufReader};
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_rustls::server::TlsStream;

    /// TLS acceptor over TCP
    pub struct TlsAcceptor {
        tcp: TcpAcceptor,
        acceptor: tokio_rustls::TlsAcceptor,
    }

    impl fmt::Debug for TlsAcceptor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TlsAcceptor")
                .field("tcp", &self.tcp)
                .field("acceptor", &"<tls>")
                .finish()
        }
    }

    impl TlsAcceptor {
        /// Bind to the given address with a TLS configuration
        pub async fn bind(addr: SocketAddr, config: ServerConfig) -> io::Result<Self> {
            Ok(Self::new(TcpAcceptor::bind(addr).await?, config))
        }

        /// Wrap an existing TCP acceptor
        pub fn new(tcp: TcpAcceptor, config: ServerConfig) -> Self {
            Self {
                tcp,
                acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
            }
        }
    }

    #[async_trait(?Send)]
    impl Acceptor for TlsAcceptor {
        type Stream = TlsStream<TcpStream>;

        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.tcp.accept().await
        }

        async fn wrap(&self, stream: TcpStream) -> io::Result<Self::Stream> {
            self.acceptor.accept(stream).await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.tcp.local_addr()
        }
    }

    /// Build a server configuration from PEM certificate chain and key files
    ///
    /// The key may be PKCS#8 or PKCS#1 (RSA).
    pub fn load_server_config(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<ServerConfig> {
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;

        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                Error::Config(ConfigError::Validation(format!(
                    "Invalid TLS certificate/key: {}",
                    e
                )))
            })
    }

    fn open(path: &Path) -> Result<BufReader<File>> {
        let file = File::open(path).map_err(|e| {
            Error::Config(ConfigError::Validation(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            )))
        })?;
        Ok(BufReader::new(file))
    }

    fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
        let certs = certs(&mut open(path)?).map_err(|e| {
            Error::Config(ConfigError::Validation(format!(
                "Failed to parse certificate file {}: {}",
                path.display(),
                e
            )))
        })?;
        if certs.is_empty() {
            return Err(Error::Config(ConfigError::Validation(format!(
                "No certificates found in {}",
                path.display()
            ))));
        }
        Ok(certs.into_iter().map(Certificate).collect())
    }

    fn load_private_key(path: &Path) -> Result<PrivateKey> {
        if let Ok(keys) = pkcs8_private_keys(&mut open(path)?) {
            if let Some(key) = keys.into_iter().next() {
                return Ok(PrivateKey(key));
            }
        }

        let keys = rsa_private_keys(&mut open(path)?).map_err(|e| {
            Error::Config(ConfigError::Validation(format!(
                "Failed to parse private key file {}: {}",
                path.display(),
                e
            )))
        })?;

        keys.into_iter().next().map(PrivateKey).ok_or_else(|| {
            Error::Config(ConfigError::Validation(format!(
                "No private keys found in {}",
                path.display()
            )))
        })
    }

}
