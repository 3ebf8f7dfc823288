//! Frame types and the frame codec.
//!
//! [`FrameView`] borrows its payload from the parser's buffer and is only
//! valid for the duration of a parser callback. [`Frame`] owns its payload
//! via `bytes::Bytes` and can be moved across tasks.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use peerwire::pool::BufferPool;
//! use peerwire::protocol::{encode_frame, parse_frame, FrameType};
//!
//! let pool = Arc::new(BufferPool::new());
//! let encoded = encode_frame(&pool, 3, FrameType::Response, b"hello").unwrap();
//!
//! let view = parse_frame(&encoded).unwrap();
//! assert_eq!(view.stream_id, 3);
//! assert_eq!(view.frame_type, FrameType::Response);
//! assert_eq!(view.payload, b"hello");
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::wire_format::{FrameType, Header, HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::error::{Result, RpcError};
use crate::pool::{BufferPool, PooledBuf};

/// A parsed frame borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameView<'a> {
    /// Multiplexed stream identifier.
    pub stream_id: u32,
    /// Frame type.
    pub frame_type: FrameType,
    /// Payload bytes (may be empty).
    pub payload: &'a [u8],
}

impl FrameView<'_> {
    /// Copy the payload out into an owned [`Frame`].
    pub fn to_owned_frame(&self) -> Frame {
        Frame {
            stream_id: self.stream_id,
            frame_type: self.frame_type,
            payload: Bytes::copy_from_slice(self.payload),
        }
    }
}

/// A complete protocol frame with an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Multiplexed stream identifier.
    pub stream_id: u32,
    /// Frame type.
    pub frame_type: FrameType,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(stream_id: u32, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Header describing this frame.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.stream_id, self.frame_type, self.payload.len() as u32)
    }
}

/// Encode header and payload into one pooled buffer.
///
/// The buffer goes back to `pool` when the returned guard is dropped.
///
/// # Errors
///
/// Returns [`RpcError::FrameTooLarge`] if the payload does not fit the
/// 24-bit length field.
pub fn encode_frame(
    pool: &Arc<BufferPool>,
    stream_id: u32,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<PooledBuf> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(RpcError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = pool.alloc_pooled(HEADER_SIZE + payload.len())?;
    Header::new(stream_id, frame_type, payload.len() as u32).encode_into(&mut buf[..HEADER_SIZE]);
    buf[HEADER_SIZE..].copy_from_slice(payload);
    Ok(buf)
}

/// Parse one complete frame (header + payload).
///
/// The returned payload borrows from `buf`; trailing bytes beyond the
/// declared length are ignored.
///
/// # Errors
///
/// Returns a protocol error if the header is invalid or the buffer is
/// shorter than the declared frame.
pub fn parse_frame(buf: &[u8]) -> Result<FrameView<'_>> {
    let header = Header::decode(buf)?;
    let end = header.frame_size();
    if buf.len() < end {
        return Err(RpcError::Protocol(format!(
            "Truncated frame: need {} bytes, got {}",
            end,
            buf.len()
        )));
    }
    Ok(FrameView {
        stream_id: header.stream_id,
        frame_type: header.frame_type,
        payload: &buf[HEADER_SIZE..end],
    })
}

/// Build a complete frame as a plain byte vector.
///
/// Unpooled counterpart of [`encode_frame`], handy for tests and captures.
///
/// ```
/// use peerwire::protocol::{build_frame, FrameType, HEADER_SIZE};
///
/// let bytes = build_frame(1, FrameType::Request, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(stream_id: u32, frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(stream_id, frame_type, payload.len() as u32);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
