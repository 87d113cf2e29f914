//! Blocking transport abstraction
//!
//! A connection reads on one handle and writes on another so that `recv()`
//! and `send()` can block on different threads. Transports therefore have to
//! be cloneable into independent handles that share the same socket.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// Bidirectional blocking byte stream
pub trait Transport: Read + Write + Send + Sync + Sized + 'static {
    /// Create another handle to the same underlying stream
    fn try_clone(&self) -> io::Result<Self>;

    /// Close both directions; blocked reads on any handle return
    fn shutdown(&self) -> io::Result<()>;

    /// Bound blocking reads on every handle of this stream
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Remote address, when the transport has one
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Whether an I/O error means a read timeout expired
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Whether an I/O error means the peer went away
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
