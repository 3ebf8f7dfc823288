//! RPC client: unary calls, streaming calls, and fire-and-forget.
//!
//! The [`ClientBuilder`] configures limits, heartbeat, codec and buffer
//! pool, then wraps a duplex byte stream into an [`RpcClient`]. Every call
//! gets a fresh odd stream id and a pending-table entry; the connection's
//! reader settles entries as Response/StreamItem/StreamEnd/Error/Close
//! frames arrive, in any order.
//!
//! # Example
//!
//! ```ignore
//! use peerwire::{CallOptions, RpcClient};
//!
//! let client = RpcClient::builder()
//!     .max_pending(1_000)
//!     .heartbeat(Duration::from_secs(30), Duration::from_secs(10))
//!     .build(socket)?;
//!
//! let reply: Echo = client.call("echo", &Echo { hello: "world".into() }, CallOptions::default()).await?;
//!
//! let mut items = client.stream::<_, Count>("count", &N { n: 3 }, Default::default()).await?;
//! while let Some(item) = items.next().await {
//!     println!("{:?}", item?);
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, MsgPackCodec, RequestEnvelope};
use crate::error::{ErrorBody, Result, RpcError};
use crate::pool::{BufferPool, PoolStats};
use crate::protocol::{Frame, FrameType, CONTROL_STREAM_ID, FAF_STREAM_ID};
use crate::sink::{AsyncSink, DEFAULT_HIGH_WATER_MARK};
use crate::transport::{FrameHandler, Transport, TransportConfig};

/// Default maximum simultaneous pending requests.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Default idle time before a Ping is sent.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default extra silence tolerated after the ping interval.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness probing settings.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Idle time after which a Ping is sent; also the check period.
    pub ping_interval: Duration,
    /// Silence tolerated beyond `ping_interval` before the peer is
    /// presumed dead and the connection is closed.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

/// Configuration for an [`RpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Calls and streams allowed in flight at once.
    pub max_pending: usize,
    /// Stream items buffered before the connection reader waits.
    pub stream_high_water_mark: usize,
    /// Heartbeat settings; `None` disables liveness probing.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Framing settings.
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            stream_high_water_mark: DEFAULT_HIGH_WATER_MARK,
            heartbeat: None,
            transport: TransportConfig::default(),
        }
    }
}

/// Per-call options for [`RpcClient::call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Reject with [`RpcError::Timeout`] if no reply arrives in time.
    pub timeout: Option<Duration>,
    /// Reject with [`RpcError::Cancelled`] when this token fires.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Options with only a timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    /// Add a cancellation token.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Per-call options for [`RpcClient::stream`].
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// End the stream with [`RpcError::Cancelled`] when this token fires.
    pub cancel: Option<CancellationToken>,
}

type CloseCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Builder for configuring and creating an [`RpcClient`].
pub struct ClientBuilder<C: Codec = MsgPackCodec> {
    config: ClientConfig,
    pool: Option<Arc<BufferPool>>,
    _codec: PhantomData<fn() -> C>,
}

impl ClientBuilder<MsgPackCodec> {
    /// Create a new client builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            pool: None,
            _codec: PhantomData,
        }
    }
}

impl Default for ClientBuilder<MsgPackCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> ClientBuilder<C> {
    /// Switch the payload codec.
    pub fn codec<C2: Codec>(self) -> ClientBuilder<C2> {
        ClientBuilder {
            config: self.config,
            pool: self.pool,
            _codec: PhantomData,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of simultaneous pending calls.
    ///
    /// Default: 10000
    pub fn max_pending(mut self, limit: usize) -> Self {
        self.config.max_pending = limit;
        self
    }

    /// Set the per-stream high-water mark.
    ///
    /// Default: 100
    pub fn stream_high_water_mark(mut self, mark: usize) -> Self {
        self.config.stream_high_water_mark = mark;
        self
    }

    /// Enable the heartbeat.
    pub fn heartbeat(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.config.heartbeat = Some(HeartbeatConfig {
            ping_interval,
            pong_timeout,
        });
        self
    }

    /// Set the largest inbound payload accepted.
    ///
    /// Default: 16 MiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.transport.max_frame_size = size;
        self
    }

    /// Use `pool` for frame and read buffers instead of the shared pool.
    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Wrap `io` into a running client.
    ///
    /// Spawns the reader, writer and (if enabled) heartbeat tasks, so it
    /// must be called from within a Tokio runtime.
    pub fn build<S>(self, io: S) -> Result<RpcClient<C>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        RpcClient::start(io, self.config, self.pool.unwrap_or_else(BufferPool::shared))
    }
}

enum Pending {
    Unary(oneshot::Sender<Result<Bytes>>),
    Stream {
        sink: Arc<AsyncSink<Bytes>>,
        done: CancellationToken,
    },
}

impl Pending {
    fn reject(self, err: RpcError) {
        match self {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Stream { sink, done } => {
                sink.end(Some(err));
                done.cancel();
            }
        }
    }
}

struct ClientInner<C: Codec> {
    transport: Transport<C>,
    pending: Mutex<HashMap<u32, Pending>>,
    next_id: AtomicU32,
    config: ClientConfig,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl<C: Codec> ClientInner<C> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Allocate an odd id and insert `entry` under it.
    fn register(&self, entry: Pending) -> Result<u32> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        if pending.len() >= self.config.max_pending {
            tracing::warn!("Pending request limit {} reached", self.config.max_pending);
            return Err(RpcError::Capacity(format!(
                "Too many pending requests (max {})",
                self.config.max_pending
            )));
        }
        let id = loop {
            let id = self.next_id.fetch_add(2, Ordering::Relaxed) | 1;
            if id != FAF_STREAM_ID && !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(id, entry);
        Ok(id)
    }

    fn take(&self, id: u32) -> Option<Pending> {
        self.pending.lock().remove(&id)
    }

    /// Reject a pending call locally and tell the peer to stop.
    async fn cancel_request(&self, id: u32, err: RpcError) {
        if let Some(entry) = self.take(id) {
            entry.reject(err);
            if let Err(e) = self.transport.send_empty(id, FrameType::Close).await {
                tracing::debug!("Close for {} not sent: {}", id, e);
            }
        }
    }

    /// Closing half that needs no await; returns the callbacks to run if
    /// this call performed the close.
    fn shutdown(&self) -> Option<Vec<CloseCallback>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for entry in drained {
            entry.reject(RpcError::Closed);
        }
        self.transport.close();
        Some(std::mem::take(&mut *self.close_callbacks.lock()))
    }

    fn shutdown_in_background(&self) {
        if let Some(callbacks) = self.shutdown() {
            if callbacks.is_empty() {
                return;
            }
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(run_close_callbacks(callbacks));
                }
                Err(_) => tracing::warn!("No runtime to run {} close callbacks", callbacks.len()),
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        *self.last_activity.lock() = Instant::now();
        let id = frame.stream_id;

        match frame.frame_type {
            FrameType::Ping => {
                if let Err(e) = self.transport.send_empty(id, FrameType::Pong).await {
                    tracing::debug!("Pong not sent: {}", e);
                }
            }
            FrameType::Pong | FrameType::Ack => {}
            FrameType::Request | FrameType::Faf => {
                tracing::debug!("Client ignoring inbound {} on {}", frame.frame_type, id);
            }
            FrameType::Response => match self.take(id) {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Ok(frame.payload));
                }
                Some(Pending::Stream { sink, done }) => {
                    sink.end(None);
                    done.cancel();
                }
                None => tracing::debug!("Response for unknown stream {}", id),
            },
            FrameType::StreamItem => {
                let sink = {
                    let pending = self.pending.lock();
                    match pending.get(&id) {
                        Some(Pending::Stream { sink, .. }) => sink.clone(),
                        _ => {
                            tracing::debug!("StreamItem for unknown stream {}", id);
                            return;
                        }
                    }
                };
                if sink.push(frame.payload).await.is_err() {
                    tracing::debug!("StreamItem after stream {} ended", id);
                }
            }
            FrameType::StreamEnd => match self.take(id) {
                Some(Pending::Stream { sink, done }) => {
                    sink.end(None);
                    done.cancel();
                }
                Some(unary) => unary.reject(RpcError::Protocol(format!(
                    "StreamEnd on unary call {}",
                    id
                ))),
                None => tracing::debug!("StreamEnd for unknown stream {}", id),
            },
            FrameType::Error => {
                let err = match C::decode_body::<ErrorBody>(&frame.payload) {
                    Ok(body) => RpcError::from(body),
                    Err(e) => RpcError::Protocol(format!("Malformed error body: {}", e)),
                };
                match self.take(id) {
                    Some(entry) => entry.reject(err),
                    None => tracing::debug!("Error for unknown stream {}: {}", id, err),
                }
            }
            FrameType::Close => match self.take(id) {
                Some(entry) => entry.reject(RpcError::Cancelled(id)),
                None => tracing::debug!("Close for unknown stream {}", id),
            },
        }
    }
}

impl<C: Codec> FrameHandler for ClientInner<C> {
    fn handle_frame(&self, frame: Frame) -> BoxFuture<'_, ()> {
        Box::pin(self.dispatch(frame))
    }

    fn handle_close(&self) {
        self.shutdown_in_background();
    }
}

async fn run_close_callbacks(callbacks: Vec<CloseCallback>) {
    let results = join_all(
        callbacks
            .into_iter()
            .map(|cb| AssertUnwindSafe(async move { cb().await }).catch_unwind()),
    )
    .await;
    for result in results {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Close callback failed: {}", e),
            Err(_) => tracing::warn!("Close callback panicked"),
        }
    }
}

async fn heartbeat_loop<C: Codec>(inner: Arc<ClientInner<C>>, config: HeartbeatConfig) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    loop {
        tokio::select! {
            _ = inner.transport.closed() => break,
            _ = ticker.tick() => {}
        }
        if inner.is_closed() {
            break;
        }

        let idle = inner.last_activity.lock().elapsed();
        if idle >= config.ping_interval + config.pong_timeout {
            tracing::warn!("Connection idle for {:?} - closing", idle);
            if let Some(callbacks) = inner.shutdown() {
                run_close_callbacks(callbacks).await;
            }
            break;
        }
        if idle >= config.ping_interval {
            if let Err(e) = inner.transport.send_empty(CONTROL_STREAM_ID, FrameType::Ping).await {
                tracing::debug!("Ping not sent: {}", e);
            }
        }
    }
}

/// Removes a pending entry (and notifies the peer) if the call future is
/// dropped before it settles.
struct PendingGuard<'a, C: Codec> {
    inner: &'a Arc<ClientInner<C>>,
    id: u32,
    armed: bool,
}

impl<C: Codec> PendingGuard<'_, C> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: Codec> Drop for PendingGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            abandon(self.inner, self.id);
        }
    }
}

/// Drop-path cancellation: no await available, so the Close is spawned.
fn abandon<C: Codec>(inner: &Arc<ClientInner<C>>, id: u32) {
    let Some(entry) = inner.take(id) else {
        return;
    };
    // Ends the sink, which releases a reader waiting in `push`.
    entry.reject(RpcError::Cancelled(id));
    if inner.is_closed() {
        return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let inner = inner.clone();
        handle.spawn(async move {
            let _ = inner.transport.send_empty(id, FrameType::Close).await;
        });
    }
}

/// A running RPC client bound to one connection.
///
/// Dropping the client closes the connection.
pub struct RpcClient<C: Codec = MsgPackCodec> {
    inner: Arc<ClientInner<C>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl RpcClient<MsgPackCodec> {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder<MsgPackCodec> {
        ClientBuilder::new()
    }

    /// Wrap `io` with default settings and the MsgPack codec.
    pub fn new<S>(io: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        ClientBuilder::new().build(io)
    }
}

impl<C: Codec> RpcClient<C> {
    fn start<S>(io: S, config: ClientConfig, pool: Arc<BufferPool>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (transport, reader) = Transport::<C>::new(io, pool, config.transport.clone())?;
        let heartbeat_config = config.heartbeat.clone();

        let inner = Arc::new(ClientInner {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            config,
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            close_callbacks: Mutex::new(Vec::new()),
        });

        reader.spawn(inner.clone());
        let heartbeat = heartbeat_config.map(|hb| tokio::spawn(heartbeat_loop(inner.clone(), hb)));

        Ok(Self { inner, heartbeat })
    }

    /// Invoke `method` and wait for its single result.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Capacity`] immediately if too many calls are pending
    /// - [`RpcError::Timeout`] / [`RpcError::Cancelled`] per `opts`; a
    ///   best-effort Close is sent to the peer in both cases
    /// - [`RpcError::Application`] if the handler failed
    /// - [`RpcError::Closed`] if the connection closed first
    pub async fn call<P, R>(&self, method: &str, params: &P, opts: CallOptions) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.register(Pending::Unary(tx))?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            id,
            armed: true,
        };

        let body = RequestEnvelope { method, params };
        if let Err(e) = self.inner.transport.send(id, FrameType::Request, Some(&body)).await {
            guard.disarm();
            self.inner.take(id);
            return Err(e);
        }

        let timeout = async {
            match opts.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let payload = tokio::select! {
            biased;
            reply = rx => {
                guard.disarm();
                reply.unwrap_or(Err(RpcError::Closed))?
            }
            _ = timeout => {
                guard.disarm();
                self.inner.cancel_request(id, RpcError::Timeout(id)).await;
                return Err(RpcError::Timeout(id));
            }
            _ = cancelled => {
                guard.disarm();
                self.inner.cancel_request(id, RpcError::Cancelled(id)).await;
                return Err(RpcError::Cancelled(id));
            }
        };

        C::decode_body(&payload)
    }

    /// Invoke a streaming `method`.
    ///
    /// Items are buffered per the stream high-water mark; once the buffer
    /// is full the connection reader waits for the consumer.
    pub async fn stream<P, R>(
        &self,
        method: &str,
        params: &P,
        opts: StreamOptions,
    ) -> Result<RpcStream<R, C>>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let sink = Arc::new(AsyncSink::with_high_water_mark(
            self.inner.config.stream_high_water_mark,
        ));
        let done = CancellationToken::new();
        let id = self.inner.register(Pending::Stream {
            sink: sink.clone(),
            done: done.clone(),
        })?;

        let body = RequestEnvelope { method, params };
        if let Err(e) = self.inner.transport.send(id, FrameType::Request, Some(&body)).await {
            self.inner.take(id);
            done.cancel();
            return Err(e);
        }

        if let Some(cancel) = opts.cancel {
            let inner = self.inner.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = cancel.cancelled() => inner.cancel_request(id, RpcError::Cancelled(id)).await,
                }
            });
        }

        Ok(RpcStream {
            id,
            sink,
            done,
            inner: self.inner.clone(),
            _item: PhantomData,
        })
    }

    /// Fire-and-forget: send `method` without expecting any reply.
    pub async fn faf<P: Serialize>(&self, method: &str, params: &P) -> Result<()> {
        if self.inner.is_closed() {
            return Err(RpcError::Closed);
        }
        let body = RequestEnvelope { method, params };
        self.inner
            .transport
            .send(FAF_STREAM_ID, FrameType::Faf, Some(&body))
            .await
    }

    /// Register a callback to run once when the client closes.
    ///
    /// Callbacks run concurrently; a failing callback is logged and does
    /// not affect the others. Callbacks registered after close never run.
    pub fn on_close<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.inner.is_closed() {
            tracing::debug!("on_close registered after close; ignoring");
            return;
        }
        self.inner
            .close_callbacks
            .lock()
            .push(Box::new(move || callback().boxed()));
    }

    /// Close the connection. Idempotent.
    ///
    /// Rejects every pending call with [`RpcError::Closed`], tears down
    /// the transport, then runs the close callbacks.
    pub async fn close(&self) {
        if let Some(handle) = &self.heartbeat {
            handle.abort();
        }
        if let Some(callbacks) = self.inner.shutdown() {
            run_close_callbacks(callbacks).await;
        }
    }

    /// Wait until the connection has been closed by either side.
    pub async fn closed(&self) {
        self.inner.transport.closed().await;
    }

    /// Whether the client has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of calls and streams in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Buffer pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.transport.pool_stats()
    }
}

impl<C: Codec> Drop for RpcClient<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        self.inner.shutdown_in_background();
    }
}

/// Items of a streaming call.
///
/// Dropping the stream before it ends cancels it on the peer.
pub struct RpcStream<R, C: Codec = MsgPackCodec> {
    id: u32,
    sink: Arc<AsyncSink<Bytes>>,
    done: CancellationToken,
    inner: Arc<ClientInner<C>>,
    _item: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned, C: Codec> RpcStream<R, C> {
    /// Stream id of this call.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next item; `None` after a clean end.
    pub async fn next(&mut self) -> Option<Result<R>> {
        match self.sink.next().await? {
            Ok(payload) => Some(C::decode_body(&payload)),
            Err(e) => Some(Err(e)),
        }
    }

    /// Cancel the stream and notify the peer.
    pub async fn cancel(self) {
        self.inner
            .cancel_request(self.id, RpcError::Cancelled(self.id))
            .await;
    }

    /// Collect every remaining item, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<R>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<R>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}

impl<R, C: Codec> Drop for RpcStream<R, C> {
    fn drop(&mut self) {
        if !self.done.is_cancelled() {
            abandon(&self.inner, self.id);
        }
    }
}
