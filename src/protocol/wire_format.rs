//! Wire format encoding and decoding.
//!
//! Implements the 8-byte header format:
//! ```text
//! ┌──────────┬──────────┬──────┐
//! │ Stream ID│ Length   │ Type │
//! │ 4 bytes  │ 3 bytes  │1 byte│
//! │ uint32 LE│ uint24 LE│ u8   │
//! └──────────┴──────────┴──────┘
//! ```
//!
//! All multi-byte integers are Little Endian.

use std::fmt;

use crate::error::{Result, RpcError};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Maximum frame size accepted by default (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload length the 24-bit length field can carry.
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

/// Stream id reserved for connection-level control (ping/pong).
pub const CONTROL_STREAM_ID: u32 = 0;

/// Stream id reserved for fire-and-forget requests.
pub const FAF_STREAM_ID: u32 = u32::MAX;

/// Frame type carried in the last header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Method invocation expecting a Response or a stream.
    Request = 0,
    /// Unary result.
    Response = 1,
    /// One element of a streaming result.
    StreamItem = 2,
    /// Structured failure `{code, message, data?}`.
    Error = 3,
    /// Cancellation of a call or stream.
    Close = 4,
    /// Request acknowledgment.
    Ack = 5,
    /// Liveness probe.
    Ping = 6,
    /// Liveness reply.
    Pong = 7,
    /// Fire-and-forget invocation.
    Faf = 8,
    /// Natural end of a stream.
    StreamEnd = 9,
}

impl FrameType {
    /// Raw wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => FrameType::Request,
            1 => FrameType::Response,
            2 => FrameType::StreamItem,
            3 => FrameType::Error,
            4 => FrameType::Close,
            5 => FrameType::Ack,
            6 => FrameType::Ping,
            7 => FrameType::Pong,
            8 => FrameType::Faf,
            9 => FrameType::StreamEnd,
            other => {
                return Err(RpcError::Protocol(format!(
                    "Unknown frame type: {}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Multiplexed stream identifier.
    pub stream_id: u32,
    /// Payload length in bytes (24-bit on the wire).
    pub payload_length: u32,
    /// Frame type.
    pub frame_type: FrameType,
}

impl Header {
    /// Create a new header.
    pub fn new(stream_id: u32, frame_type: FrameType, payload_length: u32) -> Self {
        Self {
            stream_id,
            payload_length,
            frame_type,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use peerwire::protocol::{FrameType, Header};
    ///
    /// let header = Header::new(1, FrameType::Request, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [1, 0, 0, 0, 100, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// Only the low 24 bits of `payload_length` are written; callers check
    /// the length before building a header.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        let len = self.payload_length.to_le_bytes();
        buf[0..4].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[4..7].copy_from_slice(&len[..3]);
        buf[7] = self.frame_type.as_u8();
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the buffer is shorter than
    /// `HEADER_SIZE` or the type byte is unknown.
    ///
    /// # Example
    ///
    /// ```
    /// use peerwire::protocol::{FrameType, Header};
    ///
    /// let bytes = [42, 0, 0, 0, 5, 0, 0, 2];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.stream_id, 42);
    /// assert_eq!(header.payload_length, 5);
    /// assert_eq!(header.frame_type, FrameType::StreamItem);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(RpcError::Protocol(format!(
                "Header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            stream_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            payload_length: payload_length(buf),
            frame_type: FrameType::try_from(buf[7])?,
        })
    }

    /// Total frame size (header + payload).
    #[inline]
    pub fn frame_size(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}

/// Read the 24-bit payload length from a header without decoding the rest.
///
/// # Panics
///
/// Panics if buffer is shorter than 7 bytes.
#[inline]
pub fn payload_length(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[4], buf[5], buf[6], 0])
}
