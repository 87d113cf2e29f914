//! WebSocket protocol constants and utilities
//!
//! This module contains the fundamental protocol definitions from RFC 6455:
//! opcodes, close codes, frame header bits and handshake constants.

use std::fmt;

/// WebSocket opcodes as defined in RFC 6455 Section 5.2
///
/// Reserved opcodes (0x3-0x7, 0xB-0xF) have no variant; the codec rejects them
/// while decoding, so every `Opcode` value in the crate is one the engine handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Close frame
    Close = 0x8,
    /// Ping frame
    Ping = 0x9,
    /// Pong frame
    Pong = 0xA,
}

impl Opcode {
    /// All opcodes understood by the engine
    pub const ALL: [Opcode; 6] = [
        Opcode::Continuation,
        Opcode::Text,
        Opcode::Binary,
        Opcode::Close,
        Opcode::Ping,
        Opcode::Pong,
    ];

    /// Create an Opcode from the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Get the numeric value of the opcode
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Check if this is a control opcode
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Check if this is a data opcode
    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary | Opcode::Continuation)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Continuation => "continuation",
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Close => "close",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// WebSocket close codes as defined in RFC 6455 Section 7.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: normal closure
    Normal,
    /// 1001: endpoint going away (server shutdown, page navigation)
    Away,
    /// 1002: protocol error
    Protocol,
    /// 1003: unsupported data
    Unsupported,
    /// 1005: no status code present (never sent on the wire)
    NoStatus,
    /// 1006: abnormal closure (never sent on the wire)
    Abnormal,
    /// 1007: invalid frame payload data
    InvalidPayload,
    /// 1008: policy violation
    Policy,
    /// 1009: message too big
    TooBig,
    /// 1010: mandatory extension missing
    Extension,
    /// 1011: internal error
    Internal,
    /// 1015: TLS handshake failure (never sent on the wire)
    Tls,
    /// IANA-registered (1012-1014), library/application (3000-4999) or any
    /// other value
    Other(u16),
}

impl CloseCode {
    /// Get the numeric value of the close code
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::Tls => 1015,
            CloseCode::Other(code) => code,
        }
    }

    /// Whether a peer may legally put this code in a Close frame
    pub fn is_allowed(self) -> bool {
        match self {
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::Tls => false,
            CloseCode::Other(code) => {
                (1012..=1014).contains(&code) || (3000..=4999).contains(&code)
            }
            _ => true,
        }
    }

    /// Check if this close code indicates an error
    pub fn is_error(self) -> bool {
        !matches!(self, CloseCode::Normal | CloseCode::Away)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Internal,
            1015 => CloseCode::Tls,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code.code()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// WebSocket protocol constants
pub mod constants {
    use std::time::Duration;

    /// WebSocket protocol version
    pub const WEBSOCKET_VERSION: &str = "13";

    /// WebSocket magic string for accept calculation
    pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

    /// Maximum frame size (default)
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Maximum message size (default)
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB

    /// Default handshake timeout
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default close handshake timeout
    pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

    /// WebSocket key length in bytes (before base64)
    pub const WEBSOCKET_KEY_LEN: usize = 16;

    /// Maximum handshake head size
    pub const MAX_HEADER_SIZE: usize = 8192; // 8KB

    /// Maximum number of handshake headers parsed
    pub const MAX_HEADERS: usize = 64;

    /// Largest payload a control frame may carry
    pub const MAX_CONTROL_PAYLOAD: usize = 125;

    /// Maximum close reason size (control payload minus the code)
    pub const MAX_CLOSE_REASON_SIZE: usize = 123;

    /// Read chunk size used by the I/O adapters
    pub const READ_CHUNK_SIZE: usize = 4096;
}

/// Frame header bit positions and masks
pub mod frame {
    /// FIN bit position
    pub const FIN_BIT: u8 = 0x80;

    /// RSV1, RSV2 and RSV3 bits
    pub const RSV_BITS: u8 = 0x70;

    /// Opcode mask
    pub const OPCODE_MASK: u8 = 0x0F;

    /// MASK bit position
    pub const MASK_BIT: u8 = 0x80;

    /// Payload length mask for 7-bit length
    pub const PAYLOAD_LEN_MASK: u8 = 0x7F;

    /// Extended payload length (16-bit) marker
    pub const PAYLOAD_LEN_16: u8 = 126;

    /// Extended payload length (64-bit) marker
    pub const PAYLOAD_LEN_64: u8 = 127;

    /// Masking key length
    pub const MASKING_KEY_LEN: usize = 4;
}

/// HTTP header names (lowercase for comparisons)
pub mod http_header {
    /// Host header
    pub const HOST: &str = "host";

    /// Connection header
    pub const CONNECTION: &str = "connection";

    /// Upgrade header
    pub const UPGRADE: &str = "upgrade";

    /// Sec-WebSocket-Key header
    pub const SEC_WEBSOCKET_KEY: &str = "sec-websocket-key";

    /// Sec-WebSocket-Version header
    pub const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";

    /// Sec-WebSocket-Accept header
    pub const SEC_WEBSOCKET_ACCEPT: &str = "sec-websocket-accept";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::from_u8(0x1), Some(Opcode::Text));
        assert_eq!(Opcode::from_u8(0x3), None);
        assert_eq!(Opcode::from_u8(0xB), None);
        assert_eq!(Opcode::Text.value(), 0x1);
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Binary.is_data());
        for opcode in Opcode::ALL {
            assert_eq!(Opcode::from_u8(opcode.value()), Some(opcode));
        }
    }

    #[test]
    fn test_close_code_conversion() {
        assert_eq!(CloseCode::from(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from(1007), CloseCode::InvalidPayload);
        assert_eq!(CloseCode::from(3000), CloseCode::Other(3000));
        assert_eq!(u16::from(CloseCode::Internal), 1011);
        assert_eq!(CloseCode::Away.to_string(), "1001");
    }

    #[test]
    fn test_close_code_validation() {
        assert!(CloseCode::Normal.is_allowed());
        assert!(CloseCode::from(4999).is_allowed());
        assert!(!CloseCode::from(1005).is_allowed());
        assert!(!CloseCode::from(999).is_allowed());
        assert!(!CloseCode::from(2000).is_allowed());
        assert!(CloseCode::from(1012).is_allowed());
        assert!(CloseCode::from(1014).is_allowed());
        assert!(!CloseCode::from(1016).is_allowed());
    }
}
