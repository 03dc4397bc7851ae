//! Reusable byte-buffer pools.
//!
//! The reader leases one buffer per frame and hands it to exactly one
//! handler inside a packet descriptor; handlers lease scratch buffers for
//! serialization. Dropping a [`PooledBuf`] returns the backing storage to
//! its pool, so release happens on every exit path, including early drops
//! and cancellation.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

struct PoolInner {
    buf_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

/// Free-list of fixed-size byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of buffers of `buf_size` bytes (typically the
    /// interface's max packet size).
    pub fn new(buf_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buf_size,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Take a zero-filled buffer off the free list, allocating if empty.
    pub fn get(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buf_size].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// A buffer leased from a [`BufferPool`]; returned on drop.
pub struct PooledBuf {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_return() {
        let pool = BufferPool::new(64);
        assert_eq!(pool.free_count(), 0);

        let mut buf = pool.get();
        assert_eq!(buf.len(), 64);
        buf[0] = 0xaa;
        drop(buf);

        assert_eq!(pool.free_count(), 1);
        let buf = pool.get();
        assert_eq!(pool.free_count(), 0);
        drop(buf);
    }

    #[test]
    fn multiple_outstanding() {
        let pool = BufferPool::new(16);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.free_count(), 2);
    }
}
