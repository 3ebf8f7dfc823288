//! Circular byte buffer over one pooled slab.
//!
//! Accumulates partial socket reads until the parser can consume whole
//! frames. Reads hand out borrowed views when the requested range is
//! contiguous and fall back to a single copy when it wraps the physical
//! end of the slab.

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::Result;
use crate::pool::BufferPool;

/// Initial capacity requested from the pool.
pub const INITIAL_CAPACITY: usize = 64 * 1024;

/// Circular buffer whose storage is borrowed from a [`BufferPool`].
///
/// Invariants: `size <= capacity`, and both cursors stay in
/// `[0, capacity)`.
pub struct RingBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    size: usize,
    pool: Arc<BufferPool>,
}

impl RingBuffer {
    /// Create a ring buffer with the default initial capacity.
    pub fn new(pool: Arc<BufferPool>) -> Result<Self> {
        Self::with_capacity(pool, INITIAL_CAPACITY)
    }

    /// Create a ring buffer holding at least `capacity` bytes.
    pub fn with_capacity(pool: Arc<BufferPool>, capacity: usize) -> Result<Self> {
        let buf = pool.alloc(capacity)?;
        Ok(Self {
            buf,
            read_pos: 0,
            write_pos: 0,
            size: 0,
            pool,
        })
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn available(&self) -> usize {
        self.size
    }

    /// Whether nothing is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Physical capacity of the backing slab.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can be written without growing.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.size
    }

    /// Append `data`, growing the slab if needed.
    ///
    /// # Errors
    ///
    /// Fails if the required capacity exceeds the pool's maximum.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let needed = self.size + data.len();
        if needed > self.capacity() {
            let mut target = needed.max(self.capacity() * 2);
            let max = self.pool.max_size();
            if target > max && needed <= max {
                target = max;
            }
            self.grow(target)?;
        }

        let cap = self.capacity();
        let until_end = cap - self.write_pos;
        if data.len() <= until_end {
            self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        } else {
            let (head, tail) = data.split_at(until_end);
            self.buf[self.write_pos..].copy_from_slice(head);
            self.buf[..tail.len()].copy_from_slice(tail);
        }
        self.write_pos = (self.write_pos + data.len()) % cap;
        self.size += data.len();
        Ok(())
    }

    /// View the next `len` bytes without consuming them.
    ///
    /// Returns `None` if fewer than `len` bytes are buffered.
    pub fn peek_view(&self, len: usize) -> Option<Cow<'_, [u8]>> {
        if self.size < len {
            return None;
        }
        Some(self.view_at(self.read_pos, len))
    }

    /// View the next `len` bytes and consume them.
    ///
    /// Returns `None` if fewer than `len` bytes are buffered.
    pub fn read_view(&mut self, len: usize) -> Option<Cow<'_, [u8]>> {
        if self.size < len {
            return None;
        }
        let start = self.read_pos;
        self.read_pos = (self.read_pos + len) % self.capacity();
        self.size -= len;
        if self.size == 0 {
            self.read_pos = 0;
            self.write_pos = 0;
        }
        Some(self.view_at(start, len))
    }

    /// Release the backing slab to the pool.
    ///
    /// Equivalent to dropping the buffer.
    pub fn destroy(self) {}

    fn view_at(&self, start: usize, len: usize) -> Cow<'_, [u8]> {
        if start + len <= self.capacity() {
            Cow::Borrowed(&self.buf[start..start + len])
        } else {
            Cow::Owned(self.copy_range(start, len))
        }
    }

    fn copy_range(&self, start: usize, len: usize) -> Vec<u8> {
        let first = self.capacity() - start;
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.buf[start..]);
        out.extend_from_slice(&self.buf[..len - first]);
        out
    }

    fn grow(&mut self, capacity: usize) -> Result<()> {
        let mut next = self.pool.alloc(capacity)?;
        let cap = self.capacity();
        if self.read_pos + self.size <= cap {
            next[..self.size].copy_from_slice(&self.buf[self.read_pos..self.read_pos + self.size]);
        } else {
            let first = cap - self.read_pos;
            next[..first].copy_from_slice(&self.buf[self.read_pos..]);
            next[first..self.size].copy_from_slice(&self.buf[..self.size - first]);
        }

        let old = std::mem::replace(&mut self.buf, next);
        self.pool.release(old);
        self.read_pos = 0;
        self.write_pos = self.size % self.capacity();
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("size", &self.size)
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MEDIUM_CLASS_SIZE, SMALL_CLASS_SIZE};

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new())
    }

    #[test]
    fn test_write_then_read() {
        let mut ring = RingBuffer::new(pool()).unwrap();
        ring.write(b"hello world").unwrap();
        assert_eq!(ring.available(), 11);

        assert_eq!(&ring.peek_view(5).unwrap()[..], b"hello");
        assert_eq!(ring.available(), 11);

        assert_eq!(&ring.read_view(6).unwrap()[..], b"hello ");
        assert_eq!(&ring.read_view(5).unwrap()[..], b"world");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_insufficient_data() {
        let mut ring = RingBuffer::new(pool()).unwrap();
        ring.write(b"abc").unwrap();
        assert!(ring.peek_view(4).is_none());
        assert!(ring.read_view(4).is_none());
        assert_eq!(ring.available(), 3);
    }

    #[test]
    fn test_wraparound_copies_once() {
        let mut ring = RingBuffer::new(pool()).unwrap();
        let cap = ring.capacity();

        // Move the cursors close to the physical end.
        ring.write(&vec![0u8; cap - 4]).unwrap();
        ring.write(&[1, 2]).unwrap();
        let _ = ring.read_view(cap - 4).unwrap();

        // This write wraps: 2 bytes at the end, 4 at the start.
        ring.write(&[3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(ring.capacity(), cap);

        let view = ring.peek_view(8).unwrap();
        assert!(matches!(view, Cow::Owned(_)));
        assert_eq!(&view[..], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let first = ring.read_view(2).unwrap();
        assert!(matches!(first, Cow::Borrowed(_)));
        assert_eq!(&first[..], &[1, 2]);
    }

    #[test]
    fn test_grow_preserves_wrapped_bytes() {
        let pool = pool();
        let mut ring = RingBuffer::new(pool.clone()).unwrap();
        let cap = ring.capacity();

        ring.write(&vec![9u8; cap - 2]).unwrap();
        let _ = ring.read_view(cap - 4).unwrap();
        ring.write(b"abcd").unwrap(); // wraps

        let big: Vec<u8> = (0..cap).map(|i| (i % 251) as u8).collect();
        ring.write(&big).unwrap();
        assert_eq!(ring.capacity(), MEDIUM_CLASS_SIZE);
        assert_eq!(pool.stats().small, 1);

        assert_eq!(&ring.read_view(2).unwrap()[..], &[9, 9]);
        assert_eq!(&ring.read_view(4).unwrap()[..], b"abcd");
        assert_eq!(&ring.read_view(cap).unwrap()[..], &big[..]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_grow_to_exact_need() {
        let mut ring = RingBuffer::new(pool()).unwrap();
        let big = vec![1u8; SMALL_CLASS_SIZE * 3];
        ring.write(&big).unwrap();
        assert!(ring.capacity() >= big.len());
        assert_eq!(ring.read_view(big.len()).unwrap().len(), big.len());
    }

    #[test]
    fn test_grow_beyond_pool_max_fails() {
        let pool = Arc::new(BufferPool::with_max_size(SMALL_CLASS_SIZE));
        let mut ring = RingBuffer::new(pool).unwrap();
        ring.write(&vec![0u8; SMALL_CLASS_SIZE]).unwrap();
        assert!(ring.write(&[1]).is_err());
    }

    #[test]
    fn test_drop_releases_slab() {
        let pool = pool();
        let ring = RingBuffer::new(pool.clone()).unwrap();
        assert_eq!(pool.stats().small, 0);
        ring.destroy();
        assert_eq!(pool.stats().small, 1);
    }

    #[test]
    fn test_cursors_reset_when_drained() {
        let mut ring = RingBuffer::new(pool()).unwrap();
        ring.write(b"xyz").unwrap();
        let _ = ring.read_view(3).unwrap();
        assert_eq!(ring.free_space(), ring.capacity());
        ring.write(b"q").unwrap();
        let view = ring.peek_view(1).unwrap();
        assert!(matches!(view, Cow::Borrowed(_)));
        assert_eq!(&view[..], b"q");
    }
}
