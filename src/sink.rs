//! Backpressure-aware queue between frame arrival and stream consumption.
//!
//! The connection's reader pushes stream items into an [`AsyncSink`]; the
//! application pulls them out with [`AsyncSink::next`]. When the consumer
//! falls behind and the queue grows past the high-water mark, `push`
//! suspends until the consumer has drained it to half that mark. Wakeups
//! go through `tokio::sync::Notify`, so neither side polls.
//!
//! # Example
//!
//! ```
//! use peerwire::sink::AsyncSink;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//!
//! let sink = AsyncSink::new();
//! sink.push(1).await.unwrap();
//! sink.push(2).await.unwrap();
//! sink.end(None);
//!
//! assert_eq!(sink.next().await.unwrap().unwrap(), 1);
//! assert_eq!(sink.next().await.unwrap().unwrap(), 2);
//! assert!(sink.next().await.is_none());
//! # }
//! ```

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, RpcError};

/// Default queue length above which `push` waits.
pub const DEFAULT_HIGH_WATER_MARK: usize = 100;

struct State<T> {
    queue: VecDeque<T>,
    ended: bool,
    error: Option<RpcError>,
}

/// Single-consumer async queue with a high-water mark.
pub struct AsyncSink<T> {
    state: Mutex<State<T>>,
    high_water_mark: usize,
    /// Wakes the consumer on push/end.
    readable: Notify,
    /// Wakes blocked pushers when the queue drains or the sink ends.
    drained: Notify,
}

impl<T> AsyncSink<T> {
    /// Create a sink with the default high-water mark.
    pub fn new() -> Self {
        Self::with_high_water_mark(DEFAULT_HIGH_WATER_MARK)
    }

    /// Create a sink whose `push` waits once more than `high_water_mark`
    /// items are queued.
    pub fn with_high_water_mark(high_water_mark: usize) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                ended: false,
                error: None,
            }),
            high_water_mark: high_water_mark.max(1),
            readable: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Queue `value` and wake the consumer.
    ///
    /// If the queue is now above the high-water mark, waits until it has
    /// drained to half the mark (or the sink has ended).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] if the sink has already ended.
    pub async fn push(&self, value: T) -> Result<()> {
        let over = {
            let mut state = self.state.lock();
            if state.ended {
                return Err(RpcError::Closed);
            }
            state.queue.push_back(value);
            state.queue.len() > self.high_water_mark
        };
        self.readable.notify_one();

        if over {
            self.wait_drained().await;
        }
        Ok(())
    }

    /// Mark the sink ended, optionally with a terminal error.
    ///
    /// Items already queued are still delivered; the error is reported
    /// after them. Ending an ended sink is a no-op.
    pub fn end(&self, error: Option<RpcError>) {
        {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            state.error = error;
        }
        self.readable.notify_one();
        self.drained.notify_waiters();
    }

    /// Next item, waiting for one if the queue is empty.
    ///
    /// Returns `None` once the sink has ended and drained cleanly, or
    /// `Some(Err(_))` exactly once if it ended with an error.
    pub async fn next(&self) -> Option<Result<T>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(value) = state.queue.pop_front() {
                    let low = state.queue.len() <= self.high_water_mark / 2;
                    drop(state);
                    if low {
                        self.drained.notify_waiters();
                    }
                    return Some(Ok(value));
                }
                if state.ended {
                    return state.error.take().map(Err);
                }
            }
            self.readable.notified().await;
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Whether `end` has been called.
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// Configured high-water mark.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.ended || state.queue.len() <= self.high_water_mark / 2 {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl<T> Default for AsyncSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AsyncSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncSink")
            .field("len", &state.queue.len())
            .field("ended", &state.ended)
            .field("high_water_mark", &self.high_water_mark)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_then_end_yields_all_items() {
        let sink = AsyncSink::new();
        for i in 0..5 {
            sink.push(i).await.unwrap();
        }
        sink.end(None);

        let mut items = Vec::new();
        while let Some(item) = sink.next().await {
            items.push(item.unwrap());
        }
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert!(sink.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_after_items() {
        let sink = AsyncSink::new();
        sink.push("a").await.unwrap();
        sink.end(Some(RpcError::application(7, "boom")));

        assert_eq!(sink.next().await.unwrap().unwrap(), "a");
        let err = sink.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), 7);
        assert!(sink.next().await.is_none());
    }

    #[tokio::test]
    async fn test_push_after_end_fails() {
        let sink = AsyncSink::new();
        sink.end(None);
        assert!(matches!(sink.push(1).await, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn test_consumer_waits_for_push() {
        let sink = Arc::new(AsyncSink::new());
        let consumer = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.next().await })
        };

        tokio::task::yield_now().await;
        sink.push(42).await.unwrap();

        let item = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(item, 42);
    }

    #[tokio::test]
    async fn test_push_blocks_above_high_water_mark() {
        let sink = Arc::new(AsyncSink::with_high_water_mark(4));

        for i in 0..4 {
            sink.push(i).await.unwrap();
        }

        // The fifth push crosses the mark and must wait.
        let pusher = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.push(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());
        assert_eq!(sink.len(), 5);

        // Draining to 3 left is still above half the mark.
        sink.next().await.unwrap().unwrap();
        sink.next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        // At 2 (= mark / 2) the pusher is released.
        sink.next().await.unwrap().unwrap();
        pusher.await.unwrap().unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_end_releases_blocked_pusher() {
        let sink = Arc::new(AsyncSink::with_high_water_mark(1));
        sink.push(0).await.unwrap();

        let pusher = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.push(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        sink.end(None);
        assert!(pusher.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_end_is_first_wins() {
        let sink: AsyncSink<u8> = AsyncSink::new();
        sink.end(None);
        sink.end(Some(RpcError::Closed));
        assert!(sink.next().await.is_none());
    }
}
