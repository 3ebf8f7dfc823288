//! Transport module - per-connection framing over a duplex byte stream.
//!
//! A [`Transport`] owns the write side of one connection (through the
//! writer task) and a [`FrameReader`] owns the read side. The reader feeds
//! socket bytes through a [`FrameParser`](crate::protocol::FrameParser)
//! and delivers each frame, in arrival order, to exactly one
//! [`FrameHandler`].
//!
//! The byte stream itself is a collaborator: anything implementing
//! `AsyncRead + AsyncWrite` works, whether a TCP socket, an encrypted
//! stream layered on top of one, or `tokio::io::duplex` in tests.

mod framed;

pub use framed::{FrameHandler, FrameReader, Transport, TransportConfig};
pub use framed::{DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_QUEUE};
