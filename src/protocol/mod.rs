//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing layer:
//! - 8-byte header encoding/decoding
//! - Ring buffer for accumulating partial reads
//! - Incremental frame parser
//! - Frame structs and the pooled frame encoder

mod frame;
mod frame_parser;
mod ring_buffer;
mod wire_format;

pub use frame::{build_frame, encode_frame, parse_frame, Frame, FrameView};
pub use frame_parser::FrameParser;
pub use ring_buffer::{RingBuffer, INITIAL_CAPACITY};
pub use wire_format::{
    payload_length, FrameType, Header, CONTROL_STREAM_ID, FAF_STREAM_ID, HEADER_SIZE,
    MAX_FRAME_SIZE, MAX_PAYLOAD_LEN,
};
