//! # Buffer Pool
//!
//! Per-thread free list of byte buffers used for bundle payloads.
//!
//! Each worker thread owns its own pool, so there is no cross-thread contention.
//! Buffers are matched by capacity (smallest capacity >= the request wins) and
//! handed out with their length set to exactly the requested size. Returning a
//! buffer is an explicit [`release`] call; buffers that are too large or that
//! arrive while the pool is full are simply dropped.
//!
//! ## Usage
//! ```rust
//! use bundle_net::utils::buffer_pool;
//!
//! let mut buffer = buffer_pool::acquire(512);
//! assert_eq!(buffer.len(), 512);
//! buffer[0] = 1;
//! buffer_pool::release(buffer, 16);
//! ```

use std::cell::RefCell;

/// Largest capacity kept for reuse (4 MiB)
const MAX_POOLED_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Smallest capacity handed out
const MIN_BUFFER_CAPACITY: usize = 256;

/// Free list of buffers, kept sorted by capacity
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    /// Take a buffer of exactly `len` bytes, reusing the best-fitting pooled one.
    pub fn acquire(&mut self, len: usize) -> Vec<u8> {
        let mut buffer = match self.free.iter().position(|b| b.capacity() >= len) {
            Some(index) => self.free.remove(index),
            None => Vec::with_capacity(len.max(MIN_BUFFER_CAPACITY)),
        };
        buffer.clear();
        buffer.resize(len, 0);
        buffer
    }

    /// Return a buffer; kept only while the pool holds fewer than `max_buffers`.
    pub fn release(&mut self, mut buffer: Vec<u8>, max_buffers: usize) {
        if buffer.capacity() > MAX_POOLED_BUFFER_SIZE || self.free.len() >= max_buffers {
            return;
        }
        buffer.clear();
        let index = self
            .free
            .partition_point(|b| b.capacity() < buffer.capacity());
        self.free.insert(index, buffer);
    }

    /// Number of buffers waiting for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

thread_local! {
    static LOCAL_POOL: RefCell<BufferPool> = RefCell::new(BufferPool::new());
}

/// Acquire a buffer of `len` bytes from this thread's pool.
pub fn acquire(len: usize) -> Vec<u8> {
    LOCAL_POOL.with(|pool| pool.borrow_mut().acquire(len))
}

/// Return a buffer to this thread's pool.
pub fn release(buffer: Vec<u8>, max_buffers: usize) {
    LOCAL_POOL.with(|pool| pool.borrow_mut().release(buffer, max_buffers));
}

/// Buffers currently pooled on this thread
pub fn available() -> usize {
    LOCAL_POOL.with(|pool| pool.borrow().available())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let mut pool = BufferPool::new();
        assert_eq!(pool.available(), 0);

        let mut buf = pool.acquire(10);
        assert_eq!(buf.len(), 10);
        buf[0] = 42;

        pool.release(buf, 4);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_buffer_pool_reuse_is_sized_exactly() {
        let mut pool = BufferPool::new();
        let buf = pool.acquire(4096);
        let capacity = buf.capacity();
        pool.release(buf, 4);

        let reused = pool.acquire(100);
        assert_eq!(reused.len(), 100);
        assert!(reused.iter().all(|&b| b == 0));
        assert_eq!(reused.capacity(), capacity);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_best_fit_selected() {
        let mut pool = BufferPool::new();
        pool.release(Vec::with_capacity(8192), 4);
        pool.release(Vec::with_capacity(1024), 4);

        let buf = pool.acquire(1000);
        assert!(buf.capacity() >= 1000 && buf.capacity() < 8192);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_pool_capped() {
        let mut pool = BufferPool::new();
        for _ in 0..5 {
            pool.release(Vec::with_capacity(64), 2);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_buffer_size_limit() {
        let mut pool = BufferPool::new();
        pool.release(Vec::with_capacity(MAX_POOLED_BUFFER_SIZE + 1), 4);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_thread_local_pool() {
        let buf = acquire(32);
        let before = available();
        release(buf, 16);
        assert_eq!(available(), before + 1);
    }
}
