//! RPC server: dispatches inbound requests to registered handlers.
//!
//! One [`RpcServer`] serves one connection. Unary handlers answer with a
//! single Response or Error frame; streaming handlers emit StreamItem
//! frames followed by StreamEnd, and stop early when the caller sends
//! Close. Each request runs in its own task, so a slow handler never holds
//! up frames for other stream ids.
//!
//! # Example
//!
//! ```ignore
//! use peerwire::RpcServer;
//!
//! let server = RpcServer::builder()
//!     .method("echo", |value: serde_json::Value| async move { Ok(value) })
//!     .stream_method("count", |p: CountParams| {
//!         futures::stream::iter((0..p.n).map(|i| Ok(Item { i })))
//!     })
//!     .max_active_streams(64)
//!     .serve(socket)?;
//!
//! server.closed().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, MethodName, MsgPackCodec};
use crate::error::{ErrorBody, Result, RpcError, INVALID_REQUEST};
use crate::handler::{HandlerFuture, HandlerRegistry, HandlerStream, MethodEntry};
use crate::pool::{BufferPool, PoolStats};
use crate::protocol::{Frame, FrameType};
use crate::transport::{FrameHandler, Transport, TransportConfig};

/// Default cap on concurrently running streams per connection.
pub const DEFAULT_MAX_ACTIVE_STREAMS: usize = 1000;

/// Configuration for an [`RpcServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Streams allowed to run at once; further stream requests are
    /// rejected immediately.
    pub max_active_streams: usize,
    /// Framing settings.
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_active_streams: DEFAULT_MAX_ACTIVE_STREAMS,
            transport: TransportConfig::default(),
        }
    }
}

/// Builder for registering methods and starting an [`RpcServer`].
pub struct ServerBuilder<C: Codec = MsgPackCodec> {
    registry: HandlerRegistry<C>,
    config: ServerConfig,
    pool: Option<Arc<BufferPool>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> ServerBuilder<C> {
    /// Create a new server builder with no methods.
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: ServerConfig::default(),
            pool: None,
            _codec: PhantomData,
        }
    }

    /// Register a unary method.
    ///
    /// # Example
    ///
    /// ```ignore
    /// builder.method("add", |p: AddParams| async move { Ok(p.a + p.b) })
    /// ```
    pub fn method<F, T, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.registry.register_unary(name, handler);
        self
    }

    /// Register a streaming method.
    pub fn stream_method<F, T, R, S>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T) -> S + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        S: Stream<Item = Result<R>> + Send + 'static,
    {
        self.registry.register_stream(name, handler);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cap on concurrently running streams.
    ///
    /// Default: 1000
    pub fn max_active_streams(mut self, limit: usize) -> Self {
        self.config.max_active_streams = limit;
        self
    }

    /// Set the largest inbound payload accepted.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.transport.max_frame_size = size;
        self
    }

    /// Use `pool` for frame and read buffers instead of the shared pool.
    pub fn pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Start serving `io`. Must be called from within a Tokio runtime.
    pub fn serve<S>(self, io: S) -> Result<RpcServer<C>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        RpcServer::serve(
            io,
            Arc::new(self.registry),
            self.config,
            self.pool.unwrap_or_else(BufferPool::shared),
        )
    }
}

impl<C: Codec> Default for ServerBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner<C: Codec> {
    this: Weak<ServerInner<C>>,
    transport: Transport<C>,
    registry: Arc<HandlerRegistry<C>>,
    streams: Mutex<HashMap<u32, CancellationToken>>,
    /// Parent of every handler task's token; cancelled on shutdown.
    tasks: CancellationToken,
    config: ServerConfig,
    closed: AtomicBool,
}

impl<C: Codec> ServerInner<C> {
    async fn dispatch(&self, frame: Frame) {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Request => self.on_request(frame, false).await,
            FrameType::Faf => self.on_request(frame, true).await,
            FrameType::Close => {
                let token = self.streams.lock().remove(&id);
                match token {
                    Some(token) => {
                        tracing::debug!("Stream {} cancelled by peer", id);
                        token.cancel();
                    }
                    None => tracing::debug!("Close for unknown stream {}", id),
                }
            }
            FrameType::Ping => {
                if let Err(e) = self.transport.send_empty(id, FrameType::Pong).await {
                    tracing::debug!("Pong not sent: {}", e);
                }
            }
            FrameType::Pong => {}
            other => tracing::debug!("Server ignoring inbound {} on {}", other, id),
        }
    }

    async fn on_request(&self, frame: Frame, faf: bool) {
        let id = frame.stream_id;
        let method = match C::decode::<MethodName>(&frame.payload) {
            Ok(name) => name.method,
            Err(e) => {
                tracing::debug!("Malformed request on {}: {}", id, e);
                if !faf {
                    let err = RpcError::application(INVALID_REQUEST, "Invalid request");
                    self.send_error(id, &err).await;
                }
                return;
            }
        };

        let Some(entry) = self.registry.get(&method) else {
            if faf {
                tracing::debug!("Dropping fire-and-forget for unknown method {}", method);
            } else {
                self.send_error(id, &RpcError::method_not_found(&method)).await;
            }
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        match entry {
            MethodEntry::Unary(handler) => {
                let started = catch_unwind(AssertUnwindSafe(|| handler.call(&frame.payload)));
                let fut = match started {
                    Ok(Ok(fut)) => fut,
                    Ok(Err(e)) => return self.finish_unary(id, &method, faf, Err(e)).await,
                    Err(_) => {
                        tracing::error!("Handler for {} panicked", method);
                        return self
                            .finish_unary(id, &method, faf, Err(RpcError::internal()))
                            .await;
                    }
                };
                let tasks = self.tasks.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = tasks.cancelled() => {
                            tracing::debug!("Handler for {} on {} aborted by shutdown", method, id);
                        }
                        _ = this.run_unary(id, method.clone(), faf, fut) => {}
                    }
                });
            }
            MethodEntry::Stream(handler) => {
                if faf {
                    tracing::debug!("Fire-and-forget cannot target streaming method {}", method);
                    return;
                }
                let token = self.tasks.child_token();
                if let Err(e) = self.admit_stream(id, &token) {
                    self.send_error(id, &e).await;
                    return;
                }
                let started = catch_unwind(AssertUnwindSafe(|| handler.call(&frame.payload)));
                let items = match started {
                    Ok(Ok(items)) => items,
                    Ok(Err(e)) => {
                        self.release_stream(id, &token);
                        self.send_error(id, &e).await;
                        return;
                    }
                    Err(_) => {
                        tracing::error!("Stream handler for {} panicked", method);
                        self.release_stream(id, &token);
                        self.send_error(id, &RpcError::internal()).await;
                        return;
                    }
                };
                tokio::spawn(async move { this.run_stream(id, method, items, token).await });
            }
        }
    }

    /// Register `token` for a new stream, rejecting duplicates and
    /// enforcing the active-stream cap.
    fn admit_stream(&self, id: u32, token: &CancellationToken) -> Result<()> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&id) {
            return Err(RpcError::application(
                INVALID_REQUEST,
                format!("Stream {} already active", id),
            ));
        }
        if streams.len() >= self.config.max_active_streams {
            tracing::warn!(
                "Active stream limit {} reached, rejecting stream {}",
                self.config.max_active_streams,
                id
            );
            return Err(RpcError::Capacity(format!(
                "Too many active streams (max {})",
                self.config.max_active_streams
            )));
        }
        streams.insert(id, token.clone());
        Ok(())
    }

    /// Drop bookkeeping for a stream that ended on its own. A cancelled
    /// token was already removed by whoever cancelled it.
    fn release_stream(&self, id: u32, token: &CancellationToken) {
        if !token.is_cancelled() {
            self.streams.lock().remove(&id);
        }
    }

    async fn run_unary(&self, id: u32, method: String, faf: bool, fut: HandlerFuture) {
        let result = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Handler for {} panicked", method);
                Err(RpcError::internal())
            }
        };
        self.finish_unary(id, &method, faf, result).await;
    }

    async fn finish_unary(&self, id: u32, method: &str, faf: bool, result: Result<Vec<u8>>) {
        if faf {
            if let Err(e) = result {
                tracing::debug!("Fire-and-forget {} failed: {}", method, e);
            }
            return;
        }
        match result {
            Ok(payload) => {
                if let Err(e) = self.transport.send_raw(id, FrameType::Response, &payload).await {
                    tracing::debug!("Response for {} not sent: {}", id, e);
                }
            }
            Err(e) => {
                if !matches!(e, RpcError::Application { .. }) {
                    tracing::warn!("Handler for {} failed: {}", method, e);
                }
                self.send_error(id, &e).await;
            }
        }
    }

    async fn run_stream(
        &self,
        id: u32,
        method: String,
        mut items: HandlerStream,
        token: CancellationToken,
    ) {
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break None,
                next = AssertUnwindSafe(items.next()).catch_unwind() => next,
            };
            match next {
                Ok(Some(Ok(payload))) => {
                    if token.is_cancelled() {
                        break None;
                    }
                    if let Err(e) = self.transport.send_raw(id, FrameType::StreamItem, &payload).await {
                        tracing::debug!("StreamItem for {} not sent: {}", id, e);
                        break None;
                    }
                }
                Ok(Some(Err(e))) => break Some(Err(e)),
                Ok(None) => break Some(Ok(())),
                Err(_) => {
                    tracing::error!("Stream handler for {} panicked", method);
                    break Some(Err(RpcError::internal()));
                }
            }
        };
        drop(items);

        let aborted = token.is_cancelled();
        self.release_stream(id, &token);
        match outcome {
            _ if aborted => tracing::debug!("Stream {} aborted", id),
            None => {}
            Some(Ok(())) => {
                if let Err(e) = self.transport.send_empty(id, FrameType::StreamEnd).await {
                    tracing::debug!("StreamEnd for {} not sent: {}", id, e);
                }
            }
            Some(Err(e)) => {
                if !matches!(e, RpcError::Application { .. }) {
                    tracing::warn!("Stream handler for {} failed: {}", method, e);
                }
                self.send_error(id, &e).await;
            }
        }
    }

    async fn send_error(&self, id: u32, err: &RpcError) {
        let body = ErrorBody::from(err);
        if let Err(e) = self.transport.send(id, FrameType::Error, Some(&body)).await {
            tracing::debug!("Error for {} not sent: {}", id, e);
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.streams.lock().clear();
        self.tasks.cancel();
        self.transport.close();
    }
}

impl<C: Codec> FrameHandler for ServerInner<C> {
    fn handle_frame(&self, frame: Frame) -> BoxFuture<'_, ()> {
        Box::pin(self.dispatch(frame))
    }

    fn handle_close(&self) {
        self.shutdown();
    }
}

/// A running RPC server bound to one connection.
///
/// Dropping the server closes the connection.
pub struct RpcServer<C: Codec = MsgPackCodec> {
    inner: Arc<ServerInner<C>>,
}

impl RpcServer<MsgPackCodec> {
    /// Create a new server builder using the MsgPack codec.
    pub fn builder() -> ServerBuilder<MsgPackCodec> {
        ServerBuilder::new()
    }
}

impl<C: Codec> RpcServer<C> {
    /// Serve `io` with an existing registry.
    ///
    /// One registry can back many connections, one server per connection.
    pub fn serve<S>(
        io: S,
        registry: Arc<HandlerRegistry<C>>,
        config: ServerConfig,
        pool: Arc<BufferPool>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (transport, reader) = Transport::<C>::new(io, pool, config.transport.clone())?;
        let inner = Arc::new_cyclic(|this| ServerInner {
            this: this.clone(),
            transport,
            registry,
            streams: Mutex::new(HashMap::new()),
            tasks: CancellationToken::new(),
            config,
            closed: AtomicBool::new(false),
        });
        reader.spawn(inner.clone());
        Ok(Self { inner })
    }

    /// Abort every running handler, unary or streaming, and close the
    /// connection. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Wait until the connection has been closed by either side.
    pub async fn closed(&self) {
        self.inner.transport.closed().await;
    }

    /// Whether the server has closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.transport.is_closed()
    }

    /// Number of streams currently running.
    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Buffer pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.transport.pool_stats()
    }
}

impl<C: Codec> Drop for RpcServer<C> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::codec::RequestEnvelope;
    use crate::error::{INTERNAL_ERROR, METHOD_NOT_FOUND, SERVER_ERROR};
    use crate::protocol::{build_frame, parse_frame, payload_length, FAF_STREAM_ID, HEADER_SIZE};

    async fn read_frame(io: &mut DuplexStream) -> Frame {
        let mut header = [0u8; HEADER_SIZE];
        io.read_exact(&mut header).await.unwrap();
        let len = payload_length(&header) as usize;
        let mut bytes = header.to_vec();
        bytes.resize(HEADER_SIZE + len, 0);
        io.read_exact(&mut bytes[HEADER_SIZE..]).await.unwrap();
        parse_frame(&bytes).unwrap().to_owned_frame()
    }

    fn request<P: Serialize>(id: u32, ty: FrameType, method: &str, params: &P) -> Vec<u8> {
        let body = MsgPackCodec::encode(&RequestEnvelope { method, params }).unwrap();
        build_frame(id, ty, &body)
    }

    fn builder() -> ServerBuilder {
        RpcServer::builder().pool(Arc::new(BufferPool::new()))
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_active_streams, DEFAULT_MAX_ACTIVE_STREAMS);
    }

    #[tokio::test]
    async fn test_unary_response() {
        let (local, mut remote) = duplex(64 * 1024);
        let _server = builder()
            .method("double", |n: i64| async move { Ok(n * 2) })
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(1, FrameType::Request, "double", &21i64))
            .await
            .unwrap();

        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.stream_id, 1);
        assert_eq!(frame.frame_type, FrameType::Response);
        assert_eq!(MsgPackCodec::decode::<i64>(&frame.payload).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (local, mut remote) = duplex(64 * 1024);
        let _server = builder().serve(local).unwrap();

        remote
            .write_all(&request(3, FrameType::Request, "missing", &()))
            .await
            .unwrap();

        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.frame_type, FrameType::Error);
        let body: ErrorBody = MsgPackCodec::decode(&frame.payload).unwrap();
        assert_eq!(body.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_faf_is_silent() {
        let (local, mut remote) = duplex(64 * 1024);
        let _server = builder().serve(local).unwrap();

        remote
            .write_all(&request(FAF_STREAM_ID, FrameType::Faf, "missing", &()))
            .await
            .unwrap();
        remote
            .write_all(&build_frame(0, FrameType::Ping, &[]))
            .await
            .unwrap();

        // The first frame back is the Pong; the faf produced nothing.
        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.frame_type, FrameType::Pong);
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let (local, mut remote) = duplex(64 * 1024);
        let _server = builder()
            .method("explode", |_: ()| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(5, FrameType::Request, "explode", &()))
            .await
            .unwrap();

        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.frame_type, FrameType::Error);
        let body: ErrorBody = MsgPackCodec::decode(&frame.payload).unwrap();
        assert_eq!(body.code, INTERNAL_ERROR);
        assert_eq!(body.message, "Internal error");
    }

    #[tokio::test]
    async fn test_stream_items_then_end() {
        let (local, mut remote) = duplex(64 * 1024);
        let _server = builder()
            .stream_method("count", |n: u32| futures::stream::iter((0..n).map(Ok)))
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(7, FrameType::Request, "count", &3u32))
            .await
            .unwrap();

        for i in 0..3u32 {
            let frame = read_frame(&mut remote).await;
            assert_eq!(frame.frame_type, FrameType::StreamItem);
            assert_eq!(MsgPackCodec::decode::<u32>(&frame.payload).unwrap(), i);
        }
        let end = read_frame(&mut remote).await;
        assert_eq!(end.frame_type, FrameType::StreamEnd);
        assert_eq!(end.stream_id, 7);
    }

    #[tokio::test]
    async fn test_stream_cap_rejects_immediately() {
        let (local, mut remote) = duplex(64 * 1024);
        let server = builder()
            .stream_method("forever", |_: ()| futures::stream::pending::<Result<u32>>())
            .max_active_streams(1)
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(1, FrameType::Request, "forever", &()))
            .await
            .unwrap();
        remote
            .write_all(&request(3, FrameType::Request, "forever", &()))
            .await
            .unwrap();

        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.frame_type, FrameType::Error);
        let body: ErrorBody = MsgPackCodec::decode(&frame.payload).unwrap();
        assert_eq!(body.code, SERVER_ERROR);
        assert_eq!(body.message, "Capacity exceeded");
        assert_eq!(server.active_streams(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_stream_id_rejected() {
        let (local, mut remote) = duplex(64 * 1024);
        let server = builder()
            .stream_method("forever", |_: ()| futures::stream::pending::<Result<u32>>())
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(9, FrameType::Request, "forever", &()))
            .await
            .unwrap();
        remote
            .write_all(&request(9, FrameType::Request, "forever", &()))
            .await
            .unwrap();

        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.frame_type, FrameType::Error);
        let body: ErrorBody = MsgPackCodec::decode(&frame.payload).unwrap();
        assert_eq!(body.code, INVALID_REQUEST);
        assert_eq!(server.active_streams(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_stream_without_end() {
        let (local, mut remote) = duplex(64 * 1024);
        let server = builder()
            .stream_method("ticks", |_: ()| {
                futures::stream::unfold(0u32, |i| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok(i), i + 1))
                })
            })
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(11, FrameType::Request, "ticks", &()))
            .await
            .unwrap();
        let first = read_frame(&mut remote).await;
        assert_eq!(first.frame_type, FrameType::StreamItem);

        remote
            .write_all(&build_frame(11, FrameType::Close, &[]))
            .await
            .unwrap();

        // At most one in-flight item may follow the Close, never StreamEnd.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.active_streams(), 0);
        server.close();

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        let mut offset = 0;
        while offset < rest.len() {
            let view = parse_frame(&rest[offset..]).unwrap();
            assert_eq!(view.frame_type, FrameType::StreamItem);
            offset += HEADER_SIZE + view.payload.len();
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_aborts_streams() {
        let (local, mut remote) = duplex(64 * 1024);
        let server = builder()
            .stream_method("forever", |_: ()| futures::stream::pending::<Result<u32>>())
            .serve(local)
            .unwrap();

        remote
            .write_all(&request(1, FrameType::Request, "forever", &()))
            .await
            .unwrap();
        while server.active_streams() == 0 {
            tokio::task::yield_now().await;
        }

        server.close();
        server.close();
        server.closed().await;
        assert!(server.is_closed());
        assert_eq!(server.active_streams(), 0);
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_close_aborts_running_unary_handlers() {
        let started = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let (local, mut remote) = duplex(64 * 1024);
        let server = {
            let started = started.clone();
            let dropped = dropped.clone();
            builder()
                .method("slow", move |_: ()| {
                    let started = started.clone();
                    let guard = SetOnDrop(dropped.clone());
                    async move {
                        let _guard = guard;
                        started.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(())
                    }
                })
                .serve(local)
                .unwrap()
        };

        remote
            .write_all(&request(1, FrameType::Request, "slow", &()))
            .await
            .unwrap();
        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        server.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler still running after close");
    }
}
