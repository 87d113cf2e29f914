//! Error types for knsock
//!
//! Errors are grouped by where they arise: the upgrade exchange, the wire
//! protocol, payload encoding, timeouts and configuration. Each protocol-level
//! category knows which close code the engine sends when it occurs.

#![allow(missing_docs)]

use crate::message::CloseFrame;
use crate::protocol::CloseCode;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for knsock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for knsock operations
#[derive(Error, Debug)]
pub enum Error {
    /// Upgrade exchange failed; no connection was established
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Peer violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload could not be decoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A bounded wait expired
    #[error("Timeout error: {0}")]
    Timeout(#[from] TimeoutError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The connection is closed; carries the peer's close frame when one was received
    #[error("Connection closed{}", close_suffix(.0))]
    ConnectionClosed(Option<CloseFrame>),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Close code the engine sends to the peer when this error occurs
    ///
    /// `None` means no Close frame is sent: the connection either never
    /// opened or is already closed.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Protocol(ProtocolError::FrameTooLarge { .. })
            | Error::Protocol(ProtocolError::MessageTooLarge { .. }) => Some(CloseCode::TooBig),
            Error::Protocol(_) => Some(CloseCode::Protocol),
            Error::Encoding(_) => Some(CloseCode::InvalidPayload),
            Error::Io(_) | Error::Config(_) => Some(CloseCode::Internal),
            Error::Handshake(_) | Error::Timeout(_) | Error::ConnectionClosed(_) => None,
        }
    }

    /// Check if this error is a normal termination signal
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_))
    }

    /// Check if this error happened during the upgrade exchange
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_) | Error::Timeout(TimeoutError::Handshake { .. })
        )
    }
}

fn close_suffix(frame: &Option<CloseFrame>) -> String {
    match frame {
        Some(frame) => format!(": {} {}", frame.code, frame.reason),
        None => String::new(),
    }
}

/// Upgrade exchange errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request or response head could not be parsed
    #[error("Malformed HTTP head: {0}")]
    Malformed(String),

    /// Head grew past the allowed size before it was complete
    #[error("Handshake head too large (max: {max} bytes)")]
    HeadTooLarge { max: usize },

    /// Transport ended before the head was complete
    #[error("Transport closed during handshake")]
    UnexpectedEof,

    /// Upgrade requests must use GET
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// Missing required header
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// Header present with an unacceptable value
    #[error("Invalid header value for {header}: {value}")]
    InvalidHeader { header: &'static str, value: String },

    /// Sec-WebSocket-Version other than 13
    #[error("Unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),

    /// Sec-WebSocket-Key is not a base64 encoded 16 byte nonce
    #[error("Invalid Sec-WebSocket-Key")]
    InvalidKey,

    /// Server answered with something other than 101
    #[error("Unexpected HTTP status: {0}")]
    UnexpectedStatus(u16),

    /// Sec-WebSocket-Accept does not match the key we sent
    #[error("Invalid accept key - expected: {expected}, received: {received}")]
    AcceptMismatch { expected: String, received: String },
}

/// Wire protocol violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// RSV1, RSV2 or RSV3 set without a negotiated extension
    #[error("Reserved bits set in frame")]
    ReservedBitsSet,

    /// Opcode outside the defined set
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// 64-bit length with the most significant bit set
    #[error("Invalid payload length encoding")]
    InvalidLength,

    /// Control frame payload over 125 bytes
    #[error("Control frame too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Control frame with FIN=0
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Client frame without a mask, or server frame with one
    #[error("Invalid masking (expected masked: {expected_masked})")]
    InvalidMasking { expected_masked: bool },

    /// Continuation frame with no fragmented message in progress
    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// New text/binary frame while a fragmented message is still open
    #[error("Expected continuation frame, got {0}")]
    ExpectedContinuation(crate::protocol::Opcode),

    /// Close payload of exactly one byte
    #[error("Invalid close frame payload")]
    InvalidClosePayload,

    /// Close code that may not appear on the wire
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Frame length over the configured limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: usize },

    /// Reassembled message over the configured limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Payload encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Text message is not well-formed UTF-8
    #[error("Invalid UTF-8 in text message (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    /// Close reason is not well-formed UTF-8
    #[error("Invalid UTF-8 in close reason")]
    InvalidCloseReason,
}

/// Timeout errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    /// Handshake timeout
    #[error("Handshake timeout: {timeout:?}")]
    Handshake { timeout: Duration },

    /// Close handshake timeout
    #[error("Close timeout: {timeout:?}")]
    Close { timeout: Duration },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        let err = Error::from(ProtocolError::ReservedBitsSet);
        assert_eq!(err.close_code(), Some(CloseCode::Protocol));

        let err = Error::from(ProtocolError::MessageTooLarge { size: 10, max: 5 });
        assert_eq!(err.close_code(), Some(CloseCode::TooBig));

        let err = Error::from(EncodingError::InvalidUtf8 { valid_up_to: 0 });
        assert_eq!(err.close_code(), Some(CloseCode::InvalidPayload));

        let err = Error::from(HandshakeError::InvalidKey);
        assert_eq!(err.close_code(), None);
        assert!(err.is_handshake());

        let err = Error::ConnectionClosed(None);
        assert_eq!(err.close_code(), None);
        assert!(err.is_closed());
    }

    #[test]
    fn test_error_display() {
        let err = Error::from(HandshakeError::MissingHeader("sec-websocket-key"));
        assert_eq!(
            err.to_string(),
            "Handshake error: Missing required header: sec-websocket-key"
        );

        let err = Error::ConnectionClosed(Some(CloseFrame::new(CloseCode::Normal, "bye")));
        assert_eq!(err.to_string(), "Connection closed: 1000 bye");

        let err = Error::ConnectionClosed(None);
        assert_eq!(err.to_string(), "Connection closed");
    }
}
