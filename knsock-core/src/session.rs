//! Connection state machine
//!
//! [`Session`] holds everything about a connection except the transport:
//! role, lifecycle state, the fragment-reassembly buffer and close metadata.
//! It turns incoming frames into [`Action`]s and outgoing messages into wire
//! bytes. The blocking and cooperative adapters drive the same session and
//! differ only in how they move bytes.
//!
//! ```text
//!   OPEN --(send or receive Close)--> CLOSING --(echo / end-of-stream)--> CLOSED
//!     \___________________________(error)________________________________/
//! ```

use crate::config::Config;
use crate::error::{Error, ProtocolError, Result};
use crate::frame::{self, Frame};
use crate::message::{CloseFrame, Message, MessageAssembler};
use crate::protocol::{constants::MAX_CONTROL_PAYLOAD, CloseCode, Opcode};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::time::Instant;

/// Which end of the connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiated the handshake; masks every outgoing frame
    Client,
    /// Accepted the handshake; never masks
    Server,
}

impl Role {
    /// Whether frames sent by this role are masked
    pub fn masks_outgoing(self) -> bool {
        matches!(self, Role::Client)
    }

    /// Whether frames received by this role must be masked
    pub fn expects_masked(self) -> bool {
        matches!(self, Role::Server)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Handshake done, data flows both ways
    Open,
    /// A Close frame has been sent or received
    Closing,
    /// Terminal
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Open => f.write_str("OPEN"),
            State::Closing => f.write_str("CLOSING"),
            State::Closed => f.write_str("CLOSED"),
        }
    }
}

/// What the adapter must do after a frame was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to surface yet; keep reading
    Continue,
    /// A complete message for the caller
    Message(Message),
    /// Write these bytes (a pong) and keep reading
    Reply(Bytes),
    /// The peer sent Close
    ///
    /// Write `reply` if present, flush, then call [`Session::finish`].
    Close {
        /// Echo of the peer's Close, when we had not sent one yet
        reply: Option<Bytes>,
        /// Peer's code and reason, `None` for an empty Close payload
        frame: Option<CloseFrame>,
    },
}

/// Sans-IO connection state machine
#[derive(Debug)]
pub struct Session {
    role: Role,
    state: State,
    config: Config,
    assembler: MessageAssembler,
    close_sent: bool,
    peer_close: Option<CloseFrame>,
    last_pong: Option<Instant>,
}

impl Session {
    /// Create a session for a freshly upgraded connection
    pub fn new(role: Role, config: Config) -> Self {
        Self {
            role,
            state: State::Open,
            assembler: MessageAssembler::new(config.max_message_size),
            config,
            close_sent: false,
            peer_close: None,
            last_pong: None,
        }
    }

    /// This end's role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the session is OPEN
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Whether the session is CLOSED
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Peer's close code and reason once known
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        self.peer_close.as_ref()
    }

    /// When the last pong arrived
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Connection configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The error every operation on a closed connection returns
    pub fn closed_error(&self) -> Error {
        Error::ConnectionClosed(self.peer_close.clone())
    }

    /// Decode the next frame from the adapter's read buffer
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        frame::decode(buf, self.config.max_frame_size)
    }

    /// Apply one incoming frame
    ///
    /// Frames must be fed in arrival order. On `Err` the adapter calls
    /// [`Session::fail`] and surfaces the error.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Action> {
        if self.state == State::Closed {
            return Err(self.closed_error());
        }

        if frame.masked != self.role.expects_masked() {
            return Err(ProtocolError::InvalidMasking {
                expected_masked: self.role.expects_masked(),
            }
            .into());
        }

        match frame.opcode {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                if self.state == State::Closing {
                    // Draining toward the peer's Close echo
                    tracing::trace!(len = frame.payload.len(), "discarding data frame while closing");
                    return Ok(Action::Continue);
                }
                match self.assembler.push(frame)? {
                    Some(message) => Ok(Action::Message(message)),
                    None => Ok(Action::Continue),
                }
            }
            Opcode::Ping => {
                if self.state != State::Open {
                    return Ok(Action::Continue);
                }
                tracing::trace!(len = frame.payload.len(), "answering ping");
                Ok(Action::Reply(self.encode_frame(Frame::pong(frame.payload))))
            }
            Opcode::Pong => {
                self.last_pong = Some(Instant::now());
                Ok(Action::Continue)
            }
            Opcode::Close => self.handle_close(&frame.payload),
        }
    }

    fn handle_close(&mut self, payload: &[u8]) -> Result<Action> {
        let close = CloseFrame::parse(payload)?;
        tracing::debug!(
            role = %self.role,
            code = close.as_ref().map(|c| c.code.code()),
            "received close"
        );
        self.peer_close = close.clone();
        self.assembler.clear();

        if self.close_sent {
            // Our Close was echoed: handshake complete
            self.state = State::Closed;
            return Ok(Action::Close {
                reply: None,
                frame: close,
            });
        }

        let echo = close.as_ref().map(|c| CloseFrame::new(c.code, ""));
        let reply = self.encode_frame(Frame::close(echo.as_ref()));
        self.close_sent = true;
        self.state = State::Closing;
        Ok(Action::Close {
            reply: Some(reply),
            frame: close,
        })
    }

    /// Encode an outgoing data message
    ///
    /// Honors `fragment_size`: larger payloads are split into a TEXT/BINARY
    /// frame followed by CONTINUATION frames, all in one buffer so the caller
    /// writes them in a single call.
    pub fn encode_message(&self, message: &Message) -> Result<Bytes> {
        if self.state != State::Open {
            return Err(self.closed_error());
        }

        let payload = message.as_bytes();
        let fragment_size = match self.config.fragment_size {
            Some(size) if payload.len() > size => size,
            _ => {
                let frame = Frame::new(message.opcode(), Bytes::copy_from_slice(payload));
                return Ok(self.encode_frame(frame));
            }
        };

        let count = payload.len().div_ceil(fragment_size);
        let mut buf = BytesMut::with_capacity(payload.len() + 14 * count);
        for (i, chunk) in payload.chunks(fragment_size).enumerate() {
            let opcode = if i == 0 {
                message.opcode()
            } else {
                Opcode::Continuation
            };
            let frame = Frame::new(opcode, Bytes::copy_from_slice(chunk)).fin(i + 1 == count);
            self.mask(frame).write_to(&mut buf);
        }
        Ok(buf.freeze())
    }

    /// Encode an application ping
    pub fn encode_ping(&self, payload: &[u8]) -> Result<Bytes> {
        if self.state != State::Open {
            return Err(self.closed_error());
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge(payload.len()).into());
        }
        Ok(self.encode_frame(Frame::ping(Bytes::copy_from_slice(payload))))
    }

    /// Start the close handshake
    ///
    /// Returns the Close frame to send when the session was OPEN and moves to
    /// CLOSING. Returns `Ok(None)` when a Close was already sent or received,
    /// so repeated calls put nothing on the wire.
    pub fn initiate_close(&mut self, code: CloseCode, reason: &str) -> Result<Option<Bytes>> {
        if self.state != State::Open || self.close_sent {
            return Ok(None);
        }
        if !code.is_allowed() {
            return Err(ProtocolError::InvalidCloseCode(code.code()).into());
        }

        let close = CloseFrame::new(code, reason);
        tracing::debug!(role = %self.role, code = close.code.code(), "initiating close");
        self.close_sent = true;
        self.state = State::Closing;
        self.assembler.clear();
        Ok(Some(self.encode_frame(Frame::close(Some(&close)))))
    }

    /// Abort after an error
    ///
    /// Returns a best-effort Close frame carrying the error's close code when
    /// none has been sent yet. The session is CLOSED afterwards.
    pub fn fail(&mut self, error: &Error) -> Option<Bytes> {
        let reply = match error.close_code() {
            Some(code) if !self.close_sent && self.state == State::Open => {
                tracing::debug!(role = %self.role, code = code.code(), error = %error, "failing connection");
                let close = CloseFrame::new(code, "");
                self.close_sent = true;
                Some(self.encode_frame(Frame::close(Some(&close))))
            }
            _ => None,
        };
        self.finish();
        reply
    }

    /// Transport reached end-of-stream or the close handshake finished
    pub fn finish(&mut self) {
        if self.state != State::Closed {
            tracing::trace!(role = %self.role, from = %self.state, "session closed");
        }
        self.state = State::Closed;
        self.assembler.clear();
    }

    fn mask(&self, frame: Frame) -> Frame {
        frame.mask(self.role.masks_outgoing())
    }

    fn encode_frame(&self, frame: Frame) -> Bytes {
        self.mask(frame).to_bytes()
    }
}
