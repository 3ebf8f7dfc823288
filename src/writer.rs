//! Dedicated writer task for outbound frames.
//!
//! Every sender (client calls, server handlers, heartbeat) pushes encoded
//! frames into a bounded mpsc channel; one task owns the socket's write
//! half and drains the channel, batching whatever is ready into a single
//! vectored write.
//!
//! ```text
//! call()      ─┐
//! handler     ─┼─► mpsc::Sender<PooledBuf> ─► Writer Task ─► socket
//! heartbeat   ─┘
//! ```
//!
//! A full channel suspends the sender until the writer catches up, which
//! is the transport's outbound backpressure. Frames are pooled buffers and
//! return to their pool when dropped, whether they were written or not.

use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::pool::PooledBuf;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<PooledBuf>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the writer task has stopped.
    pub async fn send(&self, frame: PooledBuf) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| RpcError::Closed)
    }

    /// Frames queued but not yet picked up by the writer.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task stops when `shutdown` is cancelled, when every handle has been
/// dropped, or on the first write error; in the error case it cancels
/// `shutdown` itself so the rest of the connection tears down too.
pub fn spawn_writer_task<W>(
    writer: W,
    channel_capacity: usize,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, shutdown.clone()).await;
        if let Err(e) = &result {
            tracing::error!("Writer task error: {}", e);
            shutdown.cancel();
        }
        result
    });
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<PooledBuf>,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = write_batch(&mut writer, &batch) => result?,
        }
    }

    // Pending frames are dropped (and released) with the receiver.
    rx.close();
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[PooledBuf]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.len()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer
            .write_vectored(&slices)
            .await
            .map_err(|e| RpcError::Transport(format!("write failed: {}", e)))?;
        if written == 0 {
            return Err(RpcError::Transport("write_vectored returned 0".into()));
        }
        total_written += written;
    }

    writer
        .flush()
        .await
        .map_err(|e| RpcError::Transport(format!("flush failed: {}", e)))?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[PooledBuf], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start_in_frame..]));
        }
        offset = end;
    }

    slices
}
