//! Message handling for knsock
//!
//! A [`Message`] is one complete application message, however many frames it
//! arrived in. [`MessageAssembler`] owns the fragment-reassembly buffer and
//! [`CloseFrame`] is the parsed form of a Close payload.

use crate::error::{EncodingError, ProtocolError, Result};
use crate::frame::Frame;
use crate::protocol::{constants::MAX_CLOSE_REASON_SIZE, CloseCode, Opcode};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Represents a complete WebSocket data message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message, always valid UTF-8
    Text(String),
    /// Binary message
    Binary(Bytes),
}

impl Message {
    /// Create a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Opcode of the first frame carrying this message
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Text(_) => Opcode::Text,
            Message::Binary(_) => Opcode::Binary,
        }
    }

    /// Get the message payload as text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    /// Get the message payload as bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    /// Consume the message, returning its payload bytes
    pub fn into_payload(self) -> Bytes {
        match self {
            Message::Text(text) => Bytes::from(text),
            Message::Binary(data) => data,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if this is a text message
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => write!(f, "Text({})", text),
            Message::Binary(data) => write!(f, "Binary({} bytes)", data.len()),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(data))
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

/// Parsed Close payload: status code and UTF-8 reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close code
    pub code: CloseCode,
    /// Close reason
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame, truncating the reason to fit a control frame
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_SIZE {
            let mut end = MAX_CLOSE_REASON_SIZE;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self {
            code: code.into(),
            reason,
        }
    }

    /// Normal closure with an empty reason
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// Encode as a Close frame payload: big-endian code followed by the reason
    pub fn to_payload(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code.code());
        payload.put_slice(self.reason.as_bytes());
        payload.freeze()
    }

    /// Parse a Close frame payload
    ///
    /// An empty payload is legal and yields `None`. A one-byte payload, a
    /// code that may not appear on the wire or a non-UTF-8 reason is an error.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => return Ok(None),
            1 => return Err(ProtocolError::InvalidClosePayload.into()),
            _ => {}
        }

        let raw = u16::from_be_bytes([payload[0], payload[1]]);
        let code = CloseCode::from(raw);
        if !code.is_allowed() {
            return Err(ProtocolError::InvalidCloseCode(raw).into());
        }

        let reason =
            std::str::from_utf8(&payload[2..]).map_err(|_| EncodingError::InvalidCloseReason)?;

        Ok(Some(Self {
            code,
            reason: reason.to_owned(),
        }))
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// Fragment-reassembly buffer for one connection
///
/// Accepts data frames only; control frames never reach it.
#[derive(Debug)]
pub struct MessageAssembler {
    /// Payload accumulated so far
    buffer: BytesMut,
    /// Opcode of the first fragment, set while a message is in progress
    opcode: Option<Opcode>,
    /// Upper bound for a reassembled message
    max_message_size: usize,
}

impl MessageAssembler {
    /// Create a new message assembler
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            opcode: None,
            max_message_size,
        }
    }

    /// Feed a data frame and try to assemble a complete message
    ///
    /// Returns `Ok(None)` while a fragmented message is still open.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = match (self.opcode, frame.opcode) {
            (None, Opcode::Continuation) => {
                return Err(ProtocolError::UnexpectedContinuation.into());
            }
            (Some(_), opcode @ (Opcode::Text | Opcode::Binary)) => {
                return Err(ProtocolError::ExpectedContinuation(opcode).into());
            }
            (None, opcode) => opcode,
            (Some(opcode), _) => opcode,
        };

        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            }
            .into());
        }

        if frame.fin && self.opcode.is_none() {
            // Unfragmented: hand the payload over without copying it
            return finish(opcode, frame.payload).map(Some);
        }

        self.opcode = Some(opcode);
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let payload = self.buffer.split().freeze();
        self.opcode = None;
        finish(opcode, payload).map(Some)
    }

    /// Check if currently assembling a message
    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }

    /// Get the number of bytes currently buffered
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.opcode = None;
    }
}

fn finish(opcode: Opcode, payload: Bytes) -> Result<Message> {
    match opcode {
        Opcode::Text => {
            let text = String::from_utf8(payload.to_vec()).map_err(|err| {
                EncodingError::InvalidUtf8 {
                    valid_up_to: err.utf8_error().valid_up_to(),
                }
            })?;
            Ok(Message::Text(text))
        }
        Opcode::Binary => Ok(Message::Binary(payload)),
        other => Err(ProtocolError::ExpectedContinuation(other).into()),
    }
}
