//! Size-classed buffer pool.
//!
//! Buffers are handed out from three classes (64 KiB, 512 KiB, 4 MiB),
//! each backed by a bounded free-list. Requests above the largest class
//! are served by a one-off allocation that is never pooled.
//!
//! Ownership is expressed by value: [`BufferPool::alloc`] moves a `Vec`
//! out to the caller and [`BufferPool::release`] moves it back, so a
//! buffer can't be released twice or used after release.
//!
//! ```
//! use peerwire::pool::{BufferPool, SMALL_CLASS_SIZE};
//!
//! let pool = BufferPool::new();
//! let buf = pool.alloc(100).unwrap();
//! assert_eq!(buf.len(), SMALL_CLASS_SIZE);
//! pool.release(buf);
//! assert_eq!(pool.stats().small, 1);
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Result, RpcError};
use crate::protocol::{HEADER_SIZE, MAX_FRAME_SIZE};

/// Small class capacity (covers the vast majority of frames).
pub const SMALL_CLASS_SIZE: usize = 64 * 1024;
/// Medium class capacity.
pub const MEDIUM_CLASS_SIZE: usize = 512 * 1024;
/// Large class capacity.
pub const LARGE_CLASS_SIZE: usize = 4 * 1024 * 1024;

/// Free-list cap for the small class.
pub const SMALL_CLASS_SLOTS: usize = 100;
/// Free-list cap for the medium class.
pub const MEDIUM_CLASS_SLOTS: usize = 20;
/// Free-list cap for the large class.
pub const LARGE_CLASS_SLOTS: usize = 5;

/// Largest buffer the pool will hand out: one maximum frame plus its header.
pub const MAX_BUFFER_SIZE: usize = MAX_FRAME_SIZE + HEADER_SIZE;

struct SizeClass {
    capacity: usize,
    slots: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl SizeClass {
    fn new(capacity: usize, slots: usize) -> Self {
        Self {
            capacity,
            slots,
            free: Mutex::new(Vec::with_capacity(slots)),
        }
    }
}

/// Free-list lengths per size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers parked in the small class.
    pub small: usize,
    /// Buffers parked in the medium class.
    pub medium: usize,
    /// Buffers parked in the large class.
    pub large: usize,
}

/// Thread-safe pool of reusable byte buffers.
///
/// Construct one per test or per process and pass it around as
/// `Arc<BufferPool>`; [`BufferPool::shared`] offers a lazily created
/// default instance.
pub struct BufferPool {
    classes: [SizeClass; 3],
    max_size: usize,
}

impl BufferPool {
    /// Create a pool with the default size classes.
    pub fn new() -> Self {
        Self::with_max_size(MAX_BUFFER_SIZE)
    }

    /// Create a pool that rejects requests above `max_size`.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            classes: [
                SizeClass::new(SMALL_CLASS_SIZE, SMALL_CLASS_SLOTS),
                SizeClass::new(MEDIUM_CLASS_SIZE, MEDIUM_CLASS_SLOTS),
                SizeClass::new(LARGE_CLASS_SIZE, LARGE_CLASS_SLOTS),
            ],
            max_size,
        }
    }

    /// Process-wide default pool, created on first use.
    pub fn shared() -> Arc<BufferPool> {
        static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(BufferPool::new())).clone()
    }

    /// Largest size `alloc` accepts.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Allocate a buffer of at least `size` bytes.
    ///
    /// The returned `Vec` has `len()` equal to the class capacity (or to
    /// `size` for unpooled allocations). Contents of recycled buffers are
    /// unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::FrameTooLarge`] if `size` exceeds the maximum.
    pub fn alloc(&self, size: usize) -> Result<Vec<u8>> {
        if size > self.max_size {
            return Err(RpcError::FrameTooLarge {
                size,
                max: self.max_size,
            });
        }

        match self.classes.iter().find(|c| size <= c.capacity) {
            Some(class) => {
                let recycled = class.free.lock().pop();
                Ok(recycled.unwrap_or_else(|| vec![0u8; class.capacity]))
            }
            None => Ok(vec![0u8; size]),
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Only buffers whose length exactly matches a class capacity are kept,
    /// and only while that class's free-list is below its cap.
    pub fn release(&self, buf: Vec<u8>) {
        if let Some(class) = self.classes.iter().find(|c| c.capacity == buf.len()) {
            let mut free = class.free.lock();
            if free.len() < class.slots {
                free.push(buf);
            }
        }
    }

    /// Allocate a buffer that releases itself back to this pool on drop.
    pub fn alloc_pooled(self: &Arc<Self>, size: usize) -> Result<PooledBuf> {
        let buf = self.alloc(size)?;
        Ok(PooledBuf {
            buf: Some(buf),
            len: size,
            pool: Arc::clone(self),
        })
    }

    /// Current free-list lengths.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            small: self.classes[0].free.lock().len(),
            medium: self.classes[1].free.lock().len(),
            large: self.classes[2].free.lock().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_size", &self.max_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A pooled buffer trimmed to a logical length.
///
/// Dereferences to the first `len` bytes; the backing buffer goes back to
/// its pool when the guard is dropped.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Logical length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the logical length is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len).finish()
    }
}
