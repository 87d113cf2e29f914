//! WebSocket frame parsing and serialization
//!
//! The codec is pure: it reads from and writes to byte buffers and never owns
//! a transport. Decoding is incremental; [`decode`] returns `Ok(None)` until a
//! whole frame is buffered and consumes nothing in that case.
//!
//! ```text
//! Byte0: FIN(1) RSV1-3(3, must be 0) Opcode(4)
//! Byte1: MASK(1) PayloadLen7(7)
//!   PayloadLen7==126 -> ExtendedLen16 (2 bytes)
//!   PayloadLen7==127 -> ExtendedLen64 (8 bytes, MSB must be 0)
//! MaskKey: 4 bytes, present iff MASK=1
//! Payload: PayloadLen bytes, XOR-unmasked with MaskKey if masked
//! ```

use crate::{
    error::{ProtocolError, Result},
    message::CloseFrame,
    protocol::{constants::MAX_CONTROL_PAYLOAD, frame::*, Opcode},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Represents a WebSocket frame according to RFC 6455
///
/// `payload` always holds the unmasked application bytes; when `mask` is set
/// the key is applied while writing and removed while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message
    pub fin: bool,
    /// Frame opcode
    pub opcode: Opcode,
    /// Indicates if the payload is masked on the wire
    pub masked: bool,
    /// Masking key (present iff `masked`)
    pub mask: Option<[u8; 4]>,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new final, unmasked frame with the given opcode and payload
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a continuation frame
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Continuation, payload)
    }

    /// Create a text frame
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Create a binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Create a close frame; `None` produces an empty close payload
    pub fn close(close: Option<&CloseFrame>) -> Self {
        let payload = close.map(CloseFrame::to_payload).unwrap_or_default();
        Self::new(Opcode::Close, payload)
    }

    /// Create a ping frame
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Create a pong frame
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Set the FIN bit
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Mask the frame with a fresh random key, or clear masking
    pub fn mask(self, enabled: bool) -> Self {
        if enabled {
            self.masked_with(rand::random::<[u8; 4]>())
        } else {
            self.unmasked()
        }
    }

    /// Mask the frame with a specific key
    pub fn masked_with(mut self, key: [u8; 4]) -> Self {
        self.masked = true;
        self.mask = Some(key);
        self
    }

    /// Clear masking
    pub fn unmasked(mut self) -> Self {
        self.masked = false;
        self.mask = None;
        self
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Total number of bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        header_len(self.payload.len(), self.masked) + self.payload.len()
    }

    /// Write the frame to a buffer using the minimal length encoding
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());

        let first_byte = (if self.fin { FIN_BIT } else { 0 }) | self.opcode.value();
        buf.put_u8(first_byte);

        let payload_len = self.payload.len();
        let mask_bit = if self.masked { MASK_BIT } else { 0 };

        if payload_len <= MAX_CONTROL_PAYLOAD {
            buf.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= u16::MAX as usize {
            buf.put_u8(mask_bit | PAYLOAD_LEN_16);
            buf.put_u16(payload_len as u16);
        } else {
            buf.put_u8(mask_bit | PAYLOAD_LEN_64);
            buf.put_u64(payload_len as u64);
        }

        match self.mask {
            Some(key) if self.masked => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], key);
            }
            _ => buf.put_slice(&self.payload),
        }
    }

    /// Parse one frame from the front of `buf`
    ///
    /// See [`decode`].
    pub fn parse(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Self>> {
        decode(buf, max_frame_size)
    }

    /// Get the payload length
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Check if this is a control frame
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Check if this is a data frame
    pub fn is_data(&self) -> bool {
        self.opcode.is_data()
    }

    /// Check if this is the final frame
    pub fn is_final(&self) -> bool {
        self.fin
    }
}

/// Encode a single frame
///
/// When `mask_required` is set a fresh random key is generated and the
/// payload is XORed with it on the way out.
pub fn encode(opcode: Opcode, payload: &[u8], fin: bool, mask_required: bool) -> Bytes {
    Frame::new(opcode, Bytes::copy_from_slice(payload))
        .fin(fin)
        .mask(mask_required)
        .to_bytes()
}

/// Decode one frame from the front of `buf`
///
/// Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed.
/// Header violations (reserved bits, unknown opcode, fragmented or oversized
/// control frames, 64-bit lengths with the top bit set, lengths over
/// `max_frame_size`) are reported as soon as the header is readable, before
/// the payload is buffered.
pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first_byte = buf[0];
    let second_byte = buf[1];

    if first_byte & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBitsSet.into());
    }

    let raw_opcode = first_byte & OPCODE_MASK;
    let opcode = Opcode::from_u8(raw_opcode).ok_or(ProtocolError::InvalidOpcode(raw_opcode))?;
    let fin = first_byte & FIN_BIT != 0;
    let masked = second_byte & MASK_BIT != 0;
    let short_len = second_byte & PAYLOAD_LEN_MASK;

    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::FragmentedControlFrame.into());
        }
        if short_len as usize > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge(short_len as usize).into());
        }
    }

    let (payload_len, len_bytes) = match short_len {
        PAYLOAD_LEN_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 2)
        }
        PAYLOAD_LEN_64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(ProtocolError::InvalidLength.into());
            }
            (len, 8)
        }
        len => (len as u64, 0),
    };

    if payload_len > max_frame_size as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: payload_len,
            max: max_frame_size,
        }
        .into());
    }

    // Bounded by max_frame_size above, so the cast cannot truncate.
    let payload_len = payload_len as usize;
    let header_len = 2 + len_bytes + if masked { MASKING_KEY_LEN } else { 0 };
    if buf.len() < header_len + payload_len {
        buf.reserve(header_len + payload_len - buf.len());
        return Ok(None);
    }

    buf.advance(2 + len_bytes);
    let mask = if masked {
        let mut key = [0u8; 4];
        buf.copy_to_slice(&mut key);
        Some(key)
    } else {
        None
    };

    let mut payload = buf.split_to(payload_len);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    tracing::trace!(opcode = %opcode, fin, masked, len = payload_len, "decoded frame");

    Ok(Some(Frame {
        fin,
        opcode,
        masked,
        mask,
        payload: payload.freeze(),
    }))
}

/// XOR `data` in place with the 4-byte masking key
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let len_bytes = if payload_len <= MAX_CONTROL_PAYLOAD {
        0
    } else if payload_len <= u16::MAX as usize {
        2
    } else {
        8
    };
    2 + len_bytes + if masked { MASKING_KEY_LEN } else { 0 }
}
