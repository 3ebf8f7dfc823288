//! # peerwire
//!
//! Binary-framed, multiplexed RPC between two peers over any duplex byte
//! stream.
//!
//! One connection carries many concurrent calls. Every frame has an 8-byte
//! header (stream id, 24-bit payload length, frame type) followed by a
//! codec-serialized payload; responses are matched to calls by stream id
//! alone, so they may arrive in any order.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): wire header, frame encoding, and an
//!   incremental parser over a growable ring buffer
//! - **Buffers** ([`pool`]): size-class buffer pool shared by every
//!   connection that is handed the same [`BufferPool`]
//! - **Transport** ([`transport`]): reader task plus batched writer task
//!   per connection
//! - **RPC**: [`RpcClient`] for unary, streaming and fire-and-forget
//!   calls; [`RpcServer`] for dispatching them to registered handlers
//!
//! The byte stream itself (TCP, an encrypted channel, an in-memory pipe)
//! is supplied by the caller; peerwire does no discovery or encryption.
//!
//! ## Example
//!
//! ```ignore
//! use peerwire::{CallOptions, RpcClient, RpcServer};
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!
//!     let _server = RpcServer::builder()
//!         .method("echo", |value: serde_json::Value| async move { Ok(value) })
//!         .serve(a)?;
//!
//!     let client = RpcClient::new(b)?;
//!     let reply: serde_json::Value = client
//!         .call("echo", &serde_json::json!({ "hello": "world" }), CallOptions::default())
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod pool;
pub mod protocol;
pub mod sink;
pub mod transport;

mod client;
mod server;
mod writer;

pub use client::{
    CallOptions, ClientBuilder, ClientConfig, HeartbeatConfig, RpcClient, RpcStream,
    StreamOptions, DEFAULT_MAX_PENDING, DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT,
};
pub use codec::{Codec, JsonCodec, MsgPackCodec};
pub use error::{ErrorBody, Result, RpcError};
pub use pool::{BufferPool, PoolStats};
pub use server::{RpcServer, ServerBuilder, ServerConfig, DEFAULT_MAX_ACTIVE_STREAMS};
pub use transport::TransportConfig;
pub use tokio_util::sync::CancellationToken;
