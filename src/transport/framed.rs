//! Framed transport over one duplex byte stream.
//!
//! # Example
//!
//! ```ignore
//! let (transport, reader) = Transport::<MsgPackCodec>::new(socket, pool, TransportConfig::default())?;
//! reader.spawn(Arc::new(my_handler));
//! transport.send(1, FrameType::Request, Some(&body)).await?;
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::codec::{Codec, MsgPackCodec};
use crate::error::{Result, RpcError};
use crate::pool::{BufferPool, PoolStats};
use crate::protocol::{encode_frame, Frame, FrameParser, FrameType, MAX_FRAME_SIZE};
use crate::writer::{spawn_writer_task, WriterHandle, DEFAULT_CHANNEL_CAPACITY};

/// Default size of the socket read buffer (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of outbound frames queued before senders wait.
pub const DEFAULT_WRITE_QUEUE: usize = DEFAULT_CHANNEL_CAPACITY;

/// Configuration for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest inbound payload accepted before the connection is dropped.
    pub max_frame_size: usize,
    /// Outbound frames queued before `send` waits for the writer.
    pub write_queue: usize,
    /// Size of each socket read.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            write_queue: DEFAULT_WRITE_QUEUE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Receiver of inbound frames for one connection.
///
/// Frames are delivered strictly in arrival order; the reader waits for
/// each `handle_frame` future before delivering the next frame.
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one inbound frame.
    fn handle_frame(&self, frame: Frame) -> BoxFuture<'_, ()>;

    /// Called once when the read side stops (EOF, read error, parse error,
    /// or local close).
    fn handle_close(&self);
}

/// Write side of a framed connection.
pub struct Transport<C: Codec = MsgPackCodec> {
    writer: WriterHandle,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> Transport<C> {
    /// Split `io` and start the writer task.
    ///
    /// Returns the transport and the [`FrameReader`] for the read half; the
    /// caller spawns the reader with its frame handler. Must be called
    /// from within a Tokio runtime.
    pub fn new<S>(
        io: S,
        pool: Arc<BufferPool>,
        config: TransportConfig,
    ) -> Result<(Self, FrameReader<ReadHalf<S>>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let parser = FrameParser::with_max_frame_size(pool.clone(), config.max_frame_size)?;
        let shutdown = CancellationToken::new();
        let (writer, _task) = spawn_writer_task(write_half, config.write_queue, shutdown.clone());

        let reader = FrameReader {
            reader: read_half,
            parser,
            shutdown: shutdown.clone(),
            read_buffer_size: config.read_buffer_size.max(1),
        };

        let transport = Self {
            writer,
            pool,
            shutdown,
            closed: AtomicBool::new(false),
            _codec: PhantomData,
        };
        Ok((transport, reader))
    }

    /// Send a frame, encoding `body` with the codec when present.
    ///
    /// An absent body produces an empty payload.
    pub async fn send<T>(&self, stream_id: u32, frame_type: FrameType, body: Option<&T>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        match body {
            Some(body) => {
                let payload = C::encode(body)?;
                self.send_raw(stream_id, frame_type, &payload).await
            }
            None => self.send_raw(stream_id, frame_type, &[]).await,
        }
    }

    /// Send a frame with no payload.
    pub async fn send_empty(&self, stream_id: u32, frame_type: FrameType) -> Result<()> {
        self.send_raw(stream_id, frame_type, &[]).await
    }

    /// Send a frame with an already encoded payload.
    ///
    /// The frame is built in a pooled buffer which returns to the pool
    /// whether or not the write succeeds.
    pub async fn send_raw(&self, stream_id: u32, frame_type: FrameType, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let frame = encode_frame(&self.pool, stream_id, frame_type, payload)?;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RpcError::Closed),
            result = self.writer.send(frame) => result,
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// Stops the writer and the reader; the frame handler's
    /// `handle_close` runs once the reader has stopped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Closing transport");
        self.shutdown.cancel();
    }

    /// Whether the transport has been closed locally or by the peer.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    /// Future that completes once the transport is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Frames waiting for the writer task.
    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    /// Free-list statistics of the buffer pool used by this transport.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Buffer pool used by this transport.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl<C: Codec> Drop for Transport<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Read side of a framed connection.
pub struct FrameReader<R> {
    reader: R,
    parser: FrameParser,
    shutdown: CancellationToken,
    read_buffer_size: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn<H>(self, handler: Arc<H>) -> JoinHandle<()>
    where
        H: FrameHandler + ?Sized,
    {
        tokio::spawn(self.run(handler))
    }

    /// Read frames until EOF, error, or close, delivering each to `handler`.
    ///
    /// A parse error is fatal: the transport is closed and nothing after
    /// the malformed frame is delivered.
    pub async fn run<H>(mut self, handler: Arc<H>)
    where
        H: FrameHandler + ?Sized,
    {
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                read = self.reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    tracing::debug!("Peer closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Read error: {}", e);
                    break;
                }
            };

            let mut frames = Vec::new();
            let parsed = self
                .parser
                .feed(&buf[..n], |view| frames.push(view.to_owned_frame()));

            for frame in frames {
                handler.handle_frame(frame).await;
            }

            if let Err(e) = parsed {
                tracing::error!("Frame parsing error: {}", e);
                break;
            }
        }

        self.shutdown.cancel();
        handler.handle_close();
    }
}
