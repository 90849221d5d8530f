//! Reusable byte buffers for body capture.
//!
//! Every captured request body and every mirrored response body is written into a buffer
//! borrowed from a [`BufferPool`]. Buffers go back to the pool once the request has been
//! logged, so a steady stream of requests settles into reusing the same allocations.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Capacity given to freshly allocated buffers.
pub const DEFAULT_CAPACITY_HINT: usize = 512;

/// Upper bound on idle buffers kept around between requests.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Buffers that grew past this capacity are dropped instead of pooled.
pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// A thread-safe pool of [`BytesMut`] buffers.
///
/// [`acquire`](Self::acquire) never fails: when no idle buffer is available a new one is
/// allocated. There is no ordering guarantee on which idle buffer is handed out.
///
/// # Examples
///
/// ```rust
/// use periscope::BufferPool;
///
/// let pool = BufferPool::new();
/// let mut buf = pool.acquire();
/// buf.extend_from_slice(b"hello");
/// pool.release(buf);
///
/// assert!(pool.acquire().is_empty());
/// ```
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
    capacity_hint: usize,
    max_idle: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    /// Create a pool with the default limits.
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_CAPACITY_HINT,
            DEFAULT_MAX_IDLE,
            DEFAULT_MAX_RETAINED_CAPACITY,
        )
    }

    /// Create a pool with explicit limits.
    ///
    /// # Arguments
    ///
    /// * `capacity_hint` - Initial capacity of buffers allocated on a pool miss
    /// * `max_idle` - Maximum number of buffers kept for reuse
    /// * `max_retained_capacity` - Buffers larger than this are not kept
    pub fn with_limits(capacity_hint: usize, max_idle: usize, max_retained_capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity_hint,
            max_idle,
            max_retained_capacity,
        }
    }

    /// Take an empty buffer from the pool, allocating one if none is idle.
    pub fn acquire(&self) -> BytesMut {
        self.idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity_hint))
    }

    /// Clear a buffer and return it to the pool.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() > self.max_retained_capacity {
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    /// Return a frozen buffer to the pool.
    ///
    /// Only succeeds when `bytes` is the last handle to its allocation; a buffer still
    /// referenced elsewhere (for example by a handler that kept the request body) is
    /// simply dropped here and freed when the other handle goes away.
    pub fn release_bytes(&self, bytes: Bytes) {
        if let Ok(buf) = bytes.try_into_mut() {
            self.release(buf);
        }
    }

    /// Number of buffers currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
