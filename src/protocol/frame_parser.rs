//! Incremental frame parser.
//!
//! Socket reads arrive in arbitrary chunks; the parser buffers them in a
//! [`RingBuffer`] and hands every complete frame to a callback as soon as
//! its last byte is buffered.
//!
//! Chunks are fed in bounded slices (never more than the ring's free
//! space, or the bytes the current frame still needs), so the ring never
//! grows past one maximum frame regardless of how large a single read is.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use peerwire::pool::BufferPool;
//! use peerwire::protocol::{build_frame, FrameParser, FrameType};
//!
//! let mut parser = FrameParser::new(Arc::new(BufferPool::new())).unwrap();
//! let bytes = build_frame(1, FrameType::Request, b"hi");
//!
//! let mut seen = Vec::new();
//! parser.feed(&bytes[..3], |f| seen.push(f.to_owned_frame())).unwrap();
//! assert!(seen.is_empty());
//! parser.feed(&bytes[3..], |f| seen.push(f.to_owned_frame())).unwrap();
//! assert_eq!(seen.len(), 1);
//! ```

use std::sync::Arc;

use super::frame::{parse_frame, FrameView};
use super::ring_buffer::RingBuffer;
use super::wire_format::{payload_length, HEADER_SIZE, MAX_FRAME_SIZE};
use crate::error::{Result, RpcError};
use crate::pool::BufferPool;

/// Extracts complete frames from a byte stream.
pub struct FrameParser {
    ring: RingBuffer,
    max_frame_size: usize,
}

impl FrameParser {
    /// Create a parser with the default maximum frame size (16 MiB).
    pub fn new(pool: Arc<BufferPool>) -> Result<Self> {
        Self::with_max_frame_size(pool, MAX_FRAME_SIZE)
    }

    /// Create a parser that rejects payloads larger than `max_frame_size`.
    pub fn with_max_frame_size(pool: Arc<BufferPool>, max_frame_size: usize) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::new(pool)?,
            max_frame_size,
        })
    }

    /// Feed a chunk and invoke `on_frame` for every frame it completes.
    ///
    /// The view passed to `on_frame` borrows the parser's buffer and must
    /// not outlive the call.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on an oversize length or an unknown frame
    /// type. The parser must not be fed again after an error.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_frame: F) -> Result<()>
    where
        F: FnMut(FrameView<'_>),
    {
        let mut rest = chunk;
        while !rest.is_empty() {
            let mut take = rest.len().min(self.ring.free_space());
            if take == 0 {
                take = rest.len().min(self.bytes_to_complete().max(1));
            }
            self.ring.write(&rest[..take])?;
            rest = &rest[take..];
            self.drain(&mut on_frame)?;
        }
        Ok(())
    }

    /// Number of buffered, not yet consumed bytes.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.ring.available()
    }

    /// Maximum accepted payload size.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn drain<F>(&mut self, on_frame: &mut F) -> Result<()>
    where
        F: FnMut(FrameView<'_>),
    {
        while self.ring.available() >= HEADER_SIZE {
            let len = match self.ring.peek_view(HEADER_SIZE) {
                Some(header) => payload_length(&header) as usize,
                None => break,
            };

            if len > self.max_frame_size {
                return Err(RpcError::Protocol(format!(
                    "Payload size {} exceeds maximum {}",
                    len, self.max_frame_size
                )));
            }

            let total = HEADER_SIZE + len;
            if self.ring.available() < total {
                break;
            }

            let data = match self.ring.read_view(total) {
                Some(data) => data,
                None => break,
            };
            on_frame(parse_frame(&data)?);
        }
        Ok(())
    }

    /// Bytes still missing before the current header or frame completes.
    fn bytes_to_complete(&self) -> usize {
        let available = self.ring.available();
        if available < HEADER_SIZE {
            return HEADER_SIZE - available;
        }
        let len = self
            .ring
            .peek_view(HEADER_SIZE)
            .map(|header| payload_length(&header) as usize)
            .unwrap_or(0);
        (HEADER_SIZE + len).saturating_sub(available)
    }
}

impl std::fmt::Debug for FrameParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameParser")
            .field("ring", &self.ring)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}
