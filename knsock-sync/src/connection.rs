//! Blocking WebSocket connection
//!
//! A [`Connection`] is a cheap, clonable handle. One thread may block in
//! [`Connection::recv`] while another calls [`Connection::send`]: reads and
//! writes go through separate handles of the same transport and only meet
//! briefly on the shared [`Session`].
//!
//! Lock order is reader, then writer, then session. The session lock is never
//! held across I/O.

use crate::transport::{is_disconnect, is_timeout, Transport};
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
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// An established WebSocket connection over a blocking transport
pub struct Connection<T: Transport = TcpStream> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    reader: Mutex<Reader<T>>,
    writer: Mutex<T>,
    session: Mutex<Session>,
    /// Handle used for shutdown and read deadlines without taking a lock
    control: T,
    released: AtomicBool,
    info: HandshakeInfo,
    peer_addr: Option<SocketAddr>,
}

struct Reader<T> {
    stream: T,
    buf: BytesMut,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            metrics::connection_closed();
        }
    }
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("Connection")
            .field("role", &session.role())
            .field("state", &session.state())
            .field("peer_addr", &self.inner.peer_addr)
            .field("resource", &self.inner.info.resource)
            .field("stream", &"<stream>")
            .finish()
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap a transport whose upgrade exchange already completed
    ///
    /// `leftover` holds bytes read past the handshake head; they are parsed
    /// before anything else is read from the transport.
    pub fn from_parts(
        stream: T,
        role: Role,
        config: Config,
        info: HandshakeInfo,
        leftover: BytesMut,
    ) -> Result<Self> {
        config.validate()?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let peer_addr = stream.peer_addr().ok();

        Ok(Self {
            inner: Arc::new(Inner {
                reader: Mutex::new(Reader {
                    stream: reader,
                    buf: leftover,
                }),
                writer: Mutex::new(stream),
                session: Mutex::new(Session::new(role, config)),
                control,
                released: AtomicBool::new(false),
                info,
                peer_addr,
            }),
        })
    }

    /// Block until a complete data message arrives
    ///
    /// Pings are answered and pongs recorded on the way. A Close from the
    /// peer is echoed and surfaces as [`Error::ConnectionClosed`] carrying
    /// the peer's code and reason; so does end-of-stream, without them.
    pub fn recv(&self) -> Result<Message> {
        let mut reader = self.inner.reader.lock();
        loop {
            if self.inner.session.lock().is_closed() {
                return Err(self.closed_error());
            }

            let frame = match self.read_frame(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!(peer = ?self.inner.peer_addr, "transport reached end of stream");
                    self.release();
                    return Err(self.closed_error());
                }
                Err(err) => return Err(self.abort(err)),
            };

            let action = self.inner.session.lock().handle_frame(frame);
            match action {
                Ok(Action::Continue) => {}
                Ok(Action::Message(message)) => {
                    metrics::message_received(message.len());
                    return Ok(message);
                }
                Ok(Action::Reply(pong)) => {
                    if let Err(err) = self.write_raw(&pong) {
                        return Err(self.abort(err.into()));
                    }
                }
                Ok(Action::Close { reply, frame }) => {
                    if let Some(reply) = reply {
                        if let Err(err) = self.write_raw(&reply) {
                            tracing::debug!(error = %err, "failed to echo close");
                        }
                    }
                    self.release();
                    return Err(Error::ConnectionClosed(frame));
                }
                Err(err) => return Err(self.abort(err)),
            }
        }
    }

    /// Send a data message as one write
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        let mut writer = self.inner.writer.lock();
        let bytes = self.inner.session.lock().encode_message(&message)?;
        if let Err(err) = write_all(&mut *writer, &bytes) {
            drop(writer);
            return Err(self.abort(err.into()));
        }
        metrics::message_sent(message.len());
        Ok(())
    }

    /// Send a text message
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text))
    }

    /// Send a binary message
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data))
    }

    /// Send a ping; the matching pong updates [`Connection::last_pong`]
    /// during a later `recv()`
    pub fn ping(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock();
        let bytes = self.inner.session.lock().encode_ping(payload)?;
        if let Err(err) = write_all(&mut *writer, &bytes) {
            drop(writer);
            return Err(self.abort(err.into()));
        }
        Ok(())
    }

    /// Run the close handshake and release the transport
    ///
    /// Sends Close with `code` and `reason` when the connection is OPEN,
    /// then waits up to the configured close timeout for the peer's echo or
    /// end-of-stream. Calling it again sends nothing. Always ends CLOSED; the
    /// only error is a code that may not be sent on the wire.
    pub fn close(&self, code: impl Into<CloseCode>, reason: &str) -> Result<State> {
        let code = code.into();
        {
            let mut writer = self.inner.writer.lock();
            let frame = self.inner.session.lock().initiate_close(code, reason)?;
            if let Some(bytes) = frame {
                if let Err(err) = write_all(&mut *writer, &bytes) {
                    tracing::debug!(error = %err, "failed to send close");
                    drop(writer);
                    self.release();
                    return Ok(State::Closed);
                }
            }
        }

        self.await_close();
        self.release();
        Ok(State::Closed)
    }

    /// This end's role
    pub fn role(&self) -> Role {
        self.inner.session.lock().role()
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.inner.session.lock().state()
    }

    /// Whether the connection reached CLOSED
    pub fn is_closed(&self) -> bool {
        self.inner.session.lock().is_closed()
    }

    /// Remote address, when the transport reports one
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
        self.inner.session.lock().close_frame().cloned()
    }

    /// When the last pong arrived
    pub fn last_pong(&self) -> Option<Instant> {
        self.inner.session.lock().last_pong()
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.inner.reader.lock().buf.len()
    }

    fn closed_error(&self) -> Error {
        self.inner.session.lock().closed_error()
    }

    /// Next frame from the read buffer, filling it as needed; `None` at
    /// end-of-stream
    fn read_frame(&self, reader: &mut Reader<T>) -> Result<Option<Frame>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(frame) = self.inner.session.lock().decode(&mut reader.buf)? {
                tracing::trace!(opcode = %frame.opcode, len = frame.payload.len(), "frame received");
                return Ok(Some(frame));
            }
            match reader.stream.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => reader.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_disconnect(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Drain incoming frames until the peer's Close, end-of-stream or the
    /// close timeout
    fn await_close(&self) {
        let timeout = self.inner.session.lock().config().close_timeout;
        let deadline = Instant::now() + timeout;

        // A concurrent recv() owns the read side and will see the echo itself
        let Some(mut reader) = self.inner.reader.try_lock_for(timeout) else {
            tracing::debug!(peer = ?self.inner.peer_addr, "reader busy, forcing close");
            return;
        };

        loop {
            if self.inner.session.lock().is_closed() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.inner.control.set_read_timeout(Some(remaining)).is_err() {
                tracing::debug!(?timeout, "close handshake timed out");
                return;
            }

            let frame = match self.read_frame(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(Error::Io(err)) if is_timeout(&err) => {
                    tracing::debug!(?timeout, "close handshake timed out");
                    return;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "error while awaiting close");
                    return;
                }
            };

            match self.inner.session.lock().handle_frame(frame) {
                Ok(Action::Close { .. }) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    /// Fail the connection: best-effort Close with the error's code, then
    /// release. Errors caused by an earlier teardown read as closed.
    fn abort(&self, err: Error) -> Error {
        let reply = {
            let mut session = self.inner.session.lock();
            if session.is_closed() {
                let closed = session.closed_error();
                drop(session);
                self.release();
                return closed;
            }
            session.fail(&err)
        };

        if let Some(reply) = reply {
            let _ = self.write_raw(&reply);
        }
        tracing::debug!(peer = ?self.inner.peer_addr, error = %err, "connection failed");
        self.release();
        err
    }

    fn write_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.writer.lock();
        write_all(&mut *writer, bytes)
    }

    /// Mark CLOSED and shut the transport down, once
    fn release(&self) {
        self.inner.session.lock().finish();
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.control.shutdown();
        metrics::connection_closed();
        tracing::debug!(peer = ?self.inner.peer_addr, "connection released");
    }
}

fn write_all<T: Write>(stream: &mut T, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes)?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use knsock_core::error::{EncodingError, ProtocolError};
    use knsock_core::protocol::Opcode;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn wrap(stream: TcpStream, role: Role, config: Config) -> Connection {
        Connection::from_parts(stream, role, config, HandshakeInfo::default(), BytesMut::new())
            .unwrap()
    }

    fn pair() -> (Connection, Connection) {
        let (client, server) = tcp_pair();
        (
            wrap(client, Role::Client, Config::default()),
            wrap(server, Role::Server, Config::default()),
        )
    }

    fn read_raw_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(frame) = knsock_core::frame::decode(buf, usize::MAX).unwrap() {
                return Some(frame);
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let (client, server) = pair();
        let echo = thread::spawn(move || {
            let message = server.recv().unwrap();
            server
                .send_text(format!("Echo: {}", message.as_text().unwrap()))
                .unwrap();
        });

        client.send("hi").unwrap();
        assert_eq!(client.recv().unwrap(), Message::text("Echo: hi"));
        echo.join().unwrap();
    }

    #[test]
    fn test_ping_pong_inside_recv() {
        let (client, server) = pair();
        client.ping(b"x").unwrap();
        client.send_binary(vec![1u8, 2, 3]).unwrap();

        assert_eq!(server.recv().unwrap(), Message::binary(vec![1u8, 2, 3]));
        server.send("r").unwrap();

        assert_eq!(client.recv().unwrap(), Message::text("r"));
        assert!(client.last_pong().is_some());
    }

    #[test]
    fn test_close_handshake_reaches_closed_on_both_sides() {
        let (client, server) = pair();
        let peer = thread::spawn(move || {
            let err = server.recv().unwrap_err();
            (server, err)
        });

        assert_eq!(client.close(CloseCode::Normal, "").unwrap(), State::Closed);
        let (server, err) = peer.join().unwrap();

        match err {
            Error::ConnectionClosed(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(server.state(), State::Closed);
        assert_eq!(client.state(), State::Closed);
        assert_eq!(client.close_frame().map(|f| f.code), Some(CloseCode::Normal));

        assert!(client.send("late").unwrap_err().is_closed());
        assert!(client.recv().unwrap_err().is_closed());
        assert!(server.send("late").unwrap_err().is_closed());
        assert!(server.recv().unwrap_err().is_closed());
    }

    #[test]
    fn test_close_is_idempotent_on_the_wire() {
        let (client, mut raw) = tcp_pair();
        let client = wrap(client, Role::Client, Config::default());

        let peer = thread::spawn(move || {
            let mut buf = BytesMut::new();
            let close = read_raw_frame(&mut raw, &mut buf).unwrap();
            assert_eq!(close.opcode, Opcode::Close);
            raw.write_all(&Frame::close(Some(&CloseFrame::normal())).to_bytes())
                .unwrap();
            // The transport ends without a second Close
            read_raw_frame(&mut raw, &mut buf)
        });

        assert_eq!(client.close(CloseCode::Normal, "").unwrap(), State::Closed);
        assert_eq!(client.close(CloseCode::Normal, "").unwrap(), State::Closed);
        assert!(peer.join().unwrap().is_none());
    }

    #[test]
    fn test_close_times_out_without_echo() {
        let (client, _raw) = tcp_pair();
        let config = Config::default().close_timeout(Duration::from_millis(100));
        let client = wrap(client, Role::Client, config);

        let started = Instant::now();
        assert_eq!(client.close(CloseCode::Away, "bye").unwrap(), State::Closed);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(client.is_closed());
    }

    #[test]
    fn test_unmasked_client_frame_fails_with_1002() {
        let (mut raw, server) = tcp_pair();
        let server = wrap(server, Role::Server, Config::default());

        raw.write_all(&Frame::text("hi").to_bytes()).unwrap();
        let err = server.recv().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidMasking { .. })
        ));
        assert!(server.is_closed());

        let close = read_raw_frame(&mut raw, &mut BytesMut::new()).unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&close.payload[..], &1002u16.to_be_bytes());
    }

    #[test]
    fn test_invalid_utf8_fails_with_1007() {
        let (mut raw, server) = tcp_pair();
        let server = wrap(server, Role::Server, Config::default());

        raw.write_all(&Frame::text(vec![0x80u8]).mask(true).to_bytes())
            .unwrap();
        let err = server.recv().unwrap_err();
        assert!(matches!(err, Error::Encoding(EncodingError::InvalidUtf8 { .. })));

        let close = read_raw_frame(&mut raw, &mut BytesMut::new()).unwrap();
        assert_eq!(&close.payload[..], &1007u16.to_be_bytes());
    }

    #[test]
    fn test_end_of_stream_is_connection_closed() {
        let (raw, server) = tcp_pair();
        let server = wrap(server, Role::Server, Config::default());
        drop(raw);

        assert!(matches!(server.recv(), Err(Error::ConnectionClosed(None))));
        assert_eq!(server.state(), State::Closed);
    }

    #[test]
    fn test_leftover_bytes_parsed_first() {
        let (client, _raw) = tcp_pair();
        let leftover = BytesMut::from(&Frame::text("early").to_bytes()[..]);
        let client = Connection::from_parts(
            client,
            Role::Client,
            Config::default(),
            HandshakeInfo::default(),
            leftover,
        )
        .unwrap();
        assert_eq!(client.recv().unwrap(), Message::text("early"));
    }

    #[test]
    fn test_concurrent_reader_and_writer() {
        let (client, server) = pair();
        let reader = client.clone();
        let inbox = thread::spawn(move || {
            (0..10)
                .map(|_| reader.recv().unwrap())
                .collect::<Vec<_>>()
        });

        for i in 0..10 {
            client.send(format!("m{}", i)).unwrap();
            let message = server.recv().unwrap();
            server.send(message).unwrap();
        }

        let received = inbox.join().unwrap();
        assert_eq!(received.len(), 10);
        assert_eq!(received[9], Message::text("m9"));
    }
}
