//! Cooperative WebSocket connection
//!
//! Connections live on one thread inside a `LocalSet`. A [`Connection`] is a
//! clonable `Rc` handle, so one task can wait in [`Connection::recv`] while
//! another sends. Reads and writes each hold their own async lock; the
//! [`Session`] is borrowed only between suspension points.
//!
//! Dropping a pending `recv()`, `send()` or `close()` future leaves no
//! half-read or half-written frame behind: the connection goes straight to
//! CLOSED.

use crate::listener::SHUTDOWN_REASON;
use bytes::{Bytes, BytesMut};
use knsock_core::config::Config;
use knsock_core::error::{Error, Result};
use knsock_core::frame::Frame;
use knsock_core::handshake::{HandshakeInfo, Headers};
use knsock_core::message::{CloseFrame, Message};
use knsock_core::metrics;
use knsock_core::protocol::constants::READ_CHUNK_SIZE;
use knsock_core::protocol::CloseCode;
use knsock_core::session::{Action, Role, Session, State};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// An established WebSocket connection on the cooperative scheduler
pub struct Connection<S = TcpStream> {
    inner: Rc<Inner<S>>,
}

struct Inner<S> {
    reader: Mutex<Reader<S>>,
    writer: Mutex<WriteHalf<S>>,
    session: RefCell<Session>,
    released: Cell<bool>,
    info: HandshakeInfo,
    peer_addr: Option<SocketAddr>,
    shutdown: Option<watch::Receiver<bool>>,
}

struct Reader<S> {
    stream: ReadHalf<S>,
    buf: BytesMut,
}

impl<S> Drop for Inner<S> {
    fn drop(&mut self) {
        if !self.released.get() {
            metrics::connection_closed();
        }
    }
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Connection");
        if let Ok(session) = self.inner.session.try_borrow() {
            debug.field("role", &session.role()).field("state", &session.state());
        }
        debug
            .field("peer_addr", &self.inner.peer_addr)
            .field("resource", &self.inner.info.resource)
            .field("stream", &"<stream>")
            .finish()
    }
}

/// Moves the session to CLOSED if an operation is dropped before it
/// finishes
///
/// `Drop` cannot await, so the transport is shut down by the next
/// `recv`/`send`/`ping`/`close` on the connection, or when the last handle
/// goes away.
struct CancelGuard<'a, S> {
    inner: &'a Inner<S>,
    armed: bool,
}

impl<'a, S> CancelGuard<'a, S> {
    fn new(inner: &'a Inner<S>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for CancelGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut session) = self.inner.session.try_borrow_mut() {
            if !session.is_closed() {
                tracing::debug!(peer = ?self.inner.peer_addr, "operation cancelled, closing connection");
                session.finish();
            }
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    /// Wrap a stream whose upgrade exchange already completed
    ///
    /// `leftover` holds bytes read past the handshake head.
    pub fn from_parts(
        stream: S,
        role: Role,
        config: Config,
        info: HandshakeInfo,
        leftover: BytesMut,
    ) -> Result<Self> {
        Self::new(stream, role, config, info, leftover, None, None)
    }

    pub(crate) fn new(
        stream: S,
        role: Role,
        config: Config,
        info: HandshakeInfo,
        leftover: BytesMut,
        peer_addr: Option<SocketAddr>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<Self> {
        config.validate()?;
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            inner: Rc::new(Inner {
                reader: Mutex::new(Reader {
                    stream: read_half,
                    buf: leftover,
                }),
                writer: Mutex::new(write_half),
                session: RefCell::new(Session::new(role, config)),
                released: Cell::new(false),
                info,
                peer_addr,
                shutdown,
            }),
        })
    }

    /// Wait for the next complete data message
    ///
    /// Pings are answered and pongs recorded on the way. A Close from the
    /// peer is echoed and surfaces as [`Error::ConnectionClosed`] with the
    /// peer's code and reason; end-of-stream surfaces the same way without
    /// them. On a listener that is shutting down, the connection is closed
    /// with 1001 first.
    pub async fn recv(&self) -> Result<Message> {
        let mut reader = self.inner.reader.lock().await;
        let guard = CancelGuard::new(&*self.inner);
        let result = self.recv_message(&mut reader).await;
        guard.disarm();
        result
    }

    async fn recv_message(&self, reader: &mut Reader<S>) -> Result<Message> {
        let mut shutdown = self.inner.shutdown.clone();
        loop {
            if self.inner.session.borrow().is_closed() {
                self.release().await;
                return Err(self.closed_error());
            }

            let next = tokio::select! {
                frame = self.read_frame(reader) => Some(frame),
                _ = shutdown_requested(&mut shutdown) => None,
            };

            let frame = match next {
                Some(Ok(Some(frame))) => frame,
                Some(Ok(None)) => {
                    tracing::debug!(peer = ?self.inner.peer_addr, "transport reached end of stream");
                    self.release().await;
                    return Err(self.closed_error());
                }
                Some(Err(err)) => return Err(self.abort(err).await),
                None => return Err(self.close_for_shutdown(reader).await),
            };

            let action = self.inner.session.borrow_mut().handle_frame(frame);
            match action {
                Ok(Action::Continue) => {}
                Ok(Action::Message(message)) => {
                    metrics::message_received(message.len());
                    return Ok(message);
                }
                Ok(Action::Reply(pong)) => {
                    if let Err(err) = self.write_raw(&pong).await {
                        return Err(self.abort(err.into()).await);
                    }
                }
                Ok(Action::Close { reply, frame }) => {
                    if let Some(reply) = reply {
                        if let Err(err) = self.write_raw(&reply).await {
                            tracing::debug!(error = %err, "failed to echo close");
                        }
                    }
                    self.release().await;
                    return Err(Error::ConnectionClosed(frame));
                }
                Err(err) => return Err(self.abort(err).await),
            }
        }
    }

    /// Send a data message as one write
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        let mut writer = self.inner.writer.lock().await;
        let encoded = self.inner.session.borrow().encode_message(&message);
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(writer);
                self.release_if_closed().await;
                return Err(err);
            }
        };

        let guard = CancelGuard::new(&*self.inner);
        let result = write_all(&mut *writer, &bytes).await;
        guard.disarm();
        drop(writer);

        match result {
            Ok(()) => {
                metrics::message_sent(message.len());
                Ok(())
            }
            Err(err) => Err(self.abort(err.into()).await),
        }
    }

    /// Send a text message
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text)).await
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data)).await
    }

    /// Send a ping; the matching pong updates [`Connection::last_pong`]
    /// during a later `recv()`
    pub async fn ping(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let encoded = self.inner.session.borrow().encode_ping(payload);
        let bytes = match encoded {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(writer);
                self.release_if_closed().await;
                return Err(err);
            }
        };

        let guard = CancelGuard::new(&*self.inner);
        let result = write_all(&mut *writer, &bytes).await;
        guard.disarm();
        drop(writer);

        match result {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(err.into()).await),
        }
    }

    /// Run the close handshake and release the transport
    ///
    /// Sends Close when the connection is OPEN, then waits up to the close
    /// timeout for the peer's echo or end-of-stream. Calling it again sends
    /// nothing. Always ends CLOSED; the only error is a code that may not be
    /// sent on the wire.
    #[cfg_attr(feature = "logging", tracing::instrument(skip_all))]
    pub async fn close(&self, code: impl Into<CloseCode>, reason: &str) -> Result<State> {
        let code = code.into();
        let timeout = self.inner.session.borrow().config().close_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let guard = CancelGuard::new(&*self.inner);

        {
            let mut writer = self.inner.writer.lock().await;
            let frame = self.inner.session.borrow_mut().initiate_close(code, reason);
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    guard.disarm();
                    return Err(err);
                }
            };
            if let Some(bytes) = frame {
                if let Err(err) = write_all(&mut *writer, &bytes).await {
                    tracing::debug!(error = %err, "failed to send close");
                    drop(writer);
                    guard.disarm();
                    self.release().await;
                    return Ok(State::Closed);
                }
            }
        }

        // A concurrent recv() owns the read side and will see the echo itself
        match tokio::time::timeout_at(deadline, self.inner.reader.lock()).await {
            Ok(mut reader) => self.drain(&mut reader, deadline).await,
            Err(_) => tracing::debug!(?timeout, "reader busy, forcing close"),
        }

        guard.disarm();
        self.release().await;
        Ok(State::Closed)
    }

    /// This end's role
    pub fn role(&self) -> Role {
        self.inner.session.borrow().role()
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.inner.session.borrow().state()
    }

    /// Whether the connection reached CLOSED
    pub fn is_closed(&self) -> bool {
        self.inner.session.borrow().is_closed()
    }

    /// Remote address, when known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Request target of the upgrade request
    pub fn resource(&self) -> &str {
        &self.inner.info.resource
    }

    /// Headers the peer sent during the handshake
    pub fn headers(&self) -> &Headers {
        &self.inner.info.headers
    }

    /// Peer's close code and reason once a Close arrived
    pub fn close_frame(&self) -> Option<CloseFrame> {
        self.inner.session.borrow().close_frame().cloned()
    }

    /// When the last pong arrived
    pub fn last_pong(&self) -> Option<Instant> {
        self.inner.session.borrow().last_pong()
    }

    fn closed_error(&self) -> Error {
        self.inner.session.borrow().closed_error()
    }

    async fn read_frame(&self, reader: &mut Reader<S>) -> Result<Option<Frame>> {
        loop {
            let decoded = self.inner.session.borrow().decode(&mut reader.buf)?;
            if let Some(frame) = decoded {
                tracing::trace!(opcode = %frame.opcode, len = frame.payload.len(), "frame received");
                return Ok(Some(frame));
            }

            reader.buf.reserve(READ_CHUNK_SIZE);
            match reader.stream.read_buf(&mut reader.buf).await {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(err) if is_disconnect(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Read until the peer's Close, end-of-stream or the deadline
    async fn drain(&self, reader: &mut Reader<S>, deadline: tokio::time::Instant) {
        loop {
            if self.inner.session.borrow().is_closed() {
                return;
            }
            match tokio::time::timeout_at(deadline, self.read_frame(reader)).await {
                Ok(Ok(Some(frame))) => {
                    let action = self.inner.session.borrow_mut().handle_frame(frame);
                    if matches!(action, Ok(Action::Close { .. }) | Err(_)) {
                        return;
                    }
                }
                Ok(_) => return,
                Err(_) => {
                    tracing::debug!(peer = ?self.inner.peer_addr, "close handshake timed out");
                    return;
                }
            }
        }
    }

    async fn close_for_shutdown(&self, reader: &mut Reader<S>) -> Error {
        tracing::debug!(peer = ?self.inner.peer_addr, "server shutdown, closing connection");
        let timeout = self.inner.session.borrow().config().close_timeout;
        let frame = self
            .inner
            .session
            .borrow_mut()
            .initiate_close(CloseCode::Away, SHUTDOWN_REASON);

        if let Ok(Some(bytes)) = frame {
            match self.write_raw(&bytes).await {
                Ok(()) => {
                    let deadline = tokio::time::Instant::now() + timeout;
                    self.drain(reader, deadline).await;
                }
                Err(err) => tracing::debug!(error = %err, "failed to send close"),
            }
        }

        self.release().await;
        self.closed_error()
    }

    /// Fail the connection: best-effort Close with the error's code, then
    /// release. Errors caused by an earlier teardown read as closed.
    async fn abort(&self, err: Error) -> Error {
        let reply = {
            let mut session = self.inner.session.borrow_mut();
            if session.is_closed() {
                Err(session.closed_error())
            } else {
                Ok(session.fail(&err))
            }
        };

        match reply {
            Err(closed) => {
                self.release().await;
                closed
            }
            Ok(reply) => {
                if let Some(reply) = reply {
                    let _ = self.write_raw(&reply).await;
                }
                tracing::debug!(peer = ?self.inner.peer_addr, error = %err, "connection failed");
                self.release().await;
                err
            }
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.writer.lock().await;
        write_all(&mut *writer, bytes).await
    }

    /// Finish a release left pending by a cancelled operation
    async fn release_if_closed(&self) {
        if self.is_closed() {
            self.release().await;
        }
    }

    /// Mark CLOSED and shut the write side down, once
    async fn release(&self) {
        self.inner.session.borrow_mut().finish();
        if self.inner.released.replace(true) {
            return;
        }

        let timeout = self.inner.session.borrow().config().close_timeout;
        if let Ok(mut writer) = tokio::time::timeout(timeout, self.inner.writer.lock()).await {
            let _ = tokio::time::timeout(timeout, writer.shutdown()).await;
        }
        metrics::connection_closed();
        tracing::debug!(peer = ?self.inner.peer_addr, "connection released");
    }
}

async fn write_all<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Resolves once the listener broadcasts shutdown; never without a listener
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use knsock_core::error::ProtocolError;
    use knsock_core::protocol::Opcode;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn wrap(stream: DuplexStream, role: Role, config: Config) -> Connection<DuplexStream> {
        Connection::from_parts(stream, role, config, HandshakeInfo::default(), BytesMut::new())
            .unwrap()
    }

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (client, server) = duplex(64 * 1024);
        (
            wrap(client, Role::Client, Config::default()),
            wrap(server, Role::Server, Config::default()),
        )
    }

    async fn read_raw_frame(stream: &mut DuplexStream, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            if let Some(frame) = knsock_core::frame::decode(buf, usize::MAX).unwrap() {
                return Some(frame);
            }
            match stream.read_buf(buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (client, server) = pair();

        let server_side = async {
            let message = server.recv().await.unwrap();
            server
                .send_text(format!("Echo: {}", message.as_text().unwrap()))
                .await
                .unwrap();
        };
        let client_side = async {
            client.send("hi").await.unwrap();
            client.recv().await.unwrap()
        };

        let ((), reply) = tokio::join!(server_side, client_side);
        assert_eq!(reply, Message::text("Echo: hi"));
    }

    #[tokio::test]
    async fn test_close_handshake_reaches_closed_on_both_sides() {
        let (client, server) = pair();

        let (state, err) = tokio::join!(client.close(CloseCode::Normal, ""), server.recv());
        assert_eq!(state.unwrap(), State::Closed);
        match err {
            Err(Error::ConnectionClosed(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("unexpected result {:?}", other),
        }

        assert_eq!(client.state(), State::Closed);
        assert_eq!(server.state(), State::Closed);
        assert!(client.send("late").await.unwrap_err().is_closed());
        assert!(server.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_on_the_wire() {
        let (client, mut raw) = duplex(64 * 1024);
        let client = wrap(client, Role::Client, Config::default());

        let peer = async {
            let mut buf = BytesMut::new();
            let close = read_raw_frame(&mut raw, &mut buf).await.unwrap();
            assert_eq!(close.opcode, Opcode::Close);
            raw.write_all(&Frame::close(Some(&CloseFrame::normal())).to_bytes())
                .await
                .unwrap();
            // Nothing follows but end-of-stream
            read_raw_frame(&mut raw, &mut buf).await
        };
        let local = async {
            let first = client.close(CloseCode::Normal, "").await.unwrap();
            let second = client.close(CloseCode::Normal, "").await.unwrap();
            (first, second)
        };

        let (trailing, (first, second)) = tokio::join!(peer, local);
        assert!(trailing.is_none());
        assert_eq!((first, second), (State::Closed, State::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_times_out_without_echo() {
        let (client, _raw) = duplex(64 * 1024);
        let client = wrap(client, Role::Client, Config::default());

        assert_eq!(client.close(CloseCode::Away, "bye").await.unwrap(), State::Closed);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_recv_closes_connection() {
        let (client, _server) = pair();

        let pending = tokio::time::timeout(Duration::from_millis(20), client.recv()).await;
        assert!(pending.is_err());
        assert_eq!(client.state(), State::Closed);
        assert!(client.recv().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_call_after_cancellation_shuts_transport_down() {
        let (client, mut raw) = duplex(64 * 1024);
        let client = wrap(client, Role::Client, Config::default());

        let pending = tokio::time::timeout(Duration::from_millis(20), client.recv()).await;
        assert!(pending.is_err());
        assert_eq!(client.state(), State::Closed);

        // The handle is still alive; the next call finishes the release
        assert!(client.send("late").await.unwrap_err().is_closed());
        let mut trailing = Vec::new();
        raw.read_to_end(&mut trailing).await.unwrap();
        assert!(trailing.is_empty());
        drop(client);
    }

    #[tokio::test]
    async fn test_ping_answered_inside_recv() {
        let (client, server) = pair();

        client.ping(b"alive").await.unwrap();
        client.send_binary(vec![7u8]).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Message::binary(vec![7u8]));

        server.send("after").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Message::text("after"));
        assert!(client.last_pong().is_some());
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_fails_with_1002() {
        let (mut raw, server) = duplex(64 * 1024);
        let server = wrap(server, Role::Server, Config::default());

        raw.write_all(&Frame::text("hi").to_bytes()).await.unwrap();
        let err = server.recv().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidMasking { .. })
        ));

        let close = read_raw_frame(&mut raw, &mut BytesMut::new()).await.unwrap();
        assert_eq!(&close.payload[..], &1002u16.to_be_bytes());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_with_1001() {
        let (client, server) = duplex(64 * 1024);
        let (tx, rx) = watch::channel(false);
        let server = Connection::new(
            server,
            Role::Server,
            Config::default(),
            HandshakeInfo::default(),
            BytesMut::new(),
            None,
            Some(rx),
        )
        .unwrap();
        let client = wrap(client, Role::Client, Config::default());

        tx.send(true).unwrap();
        let (server_result, client_result) = tokio::join!(server.recv(), client.recv());

        assert!(server_result.unwrap_err().is_closed());
        match client_result {
            Err(Error::ConnectionClosed(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Away);
                assert_eq!(frame.reason, SHUTDOWN_REASON);
            }
            other => panic!("expected shutdown close, got {:?}", other),
        }
        assert_eq!(server.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_connection_closed() {
        let (raw, server) = duplex(1024);
        let server = wrap(server, Role::Server, Config::default());
        drop(raw);

        assert!(matches!(
            server.recv().await,
            Err(Error::ConnectionClosed(None))
        ));
    }
}
