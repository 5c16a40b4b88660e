//! Process-wide pool of reusable byte buffers for chunk blocks and
//! compression scratch space.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crossbeam_queue::ArrayQueue;
use once_cell::sync::Lazy;

use crate::constants::{LARGE_BUFFER_SIZE, MEDIUM_BUFFER_SIZE, POOL_SIZE, SMALL_BUFFER_SIZE};

static GLOBAL_POOL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// The shared pool used by the chunk codec.
pub fn global() -> &'static BufferPool {
    &GLOBAL_POOL
}

/// A pool of reusable byte buffers in three size tiers
#[derive(Debug)]
pub struct BufferPool {
    small: ArrayQueue<Vec<u8>>,
    medium: ArrayQueue<Vec<u8>>,
    large: ArrayQueue<Vec<u8>>,
    stats: BufferPoolStats,
}

#[derive(Debug, Default)]
struct BufferPoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            small: ArrayQueue::new(POOL_SIZE),
            medium: ArrayQueue::new(POOL_SIZE / 2),
            large: ArrayQueue::new(POOL_SIZE / 4),
            stats: BufferPoolStats::default(),
        }
    }

    fn tier(&self, size: usize) -> Option<(&ArrayQueue<Vec<u8>>, usize)> {
        if size <= SMALL_BUFFER_SIZE {
            Some((&self.small, SMALL_BUFFER_SIZE))
        } else if size <= MEDIUM_BUFFER_SIZE {
            Some((&self.medium, MEDIUM_BUFFER_SIZE))
        } else if size <= LARGE_BUFFER_SIZE {
            Some((&self.large, LARGE_BUFFER_SIZE))
        } else {
            None
        }
    }

    /// Get an empty buffer with capacity of at least `min_size`
    pub fn get(&self, min_size: usize) -> Vec<u8> {
        let Some((queue, tier_size)) = self.tier(min_size) else {
            // Too large for pool
            return Vec::with_capacity(min_size);
        };
        match queue.pop() {
            Some(mut buf) => {
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                buf.clear();
                buf
            }
            None => {
                self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
                Vec::with_capacity(tier_size)
            }
        }
    }

    /// Like [`get`](Self::get) but returned to the pool on drop.
    pub fn acquire(&self, min_size: usize) -> PooledBuf<'_> {
        PooledBuf {
            buf: Some(self.get(min_size)),
            pool: self,
        }
    }

    /// Return a buffer to the tier its capacity fully covers
    pub fn put(&self, buf: Vec<u8>) {
        let cap = buf.capacity();
        let queue = if cap >= LARGE_BUFFER_SIZE {
            if cap > LARGE_BUFFER_SIZE * 2 {
                return;
            }
            &self.large
        } else if cap >= MEDIUM_BUFFER_SIZE {
            &self.medium
        } else if cap >= SMALL_BUFFER_SIZE {
            &self.small
        } else {
            return;
        };
        let _ = queue.push(buf);
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.stats.hits.load(AtomicOrdering::Relaxed);
        let total = hits + self.stats.misses.load(AtomicOrdering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn pooled(&self) -> usize {
        self.small.len() + self.medium.len() + self.large.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer borrowed from a [`BufferPool`]; goes back on every exit path.
#[derive(Debug)]
pub struct PooledBuf<'a> {
    buf: Option<Vec<u8>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().map_or(&EMPTY, |b| b)
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.get_or_insert_with(Vec::new)
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

static EMPTY: Vec<u8> = Vec::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.get(100);
        assert!(buf.capacity() >= SMALL_BUFFER_SIZE);
        buf.extend_from_slice(b"hello");
        pool.put(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.get(10);
        assert!(buf.is_empty());
        assert!(pool.hit_ratio() > 0.0);
    }

    #[test]
    fn test_guard_returns_buffer_on_error_path() {
        let pool = BufferPool::new();
        let res: Result<(), &str> = (|| {
            let mut buf = pool.acquire(MEDIUM_BUFFER_SIZE);
            buf.push(1);
            Err("decode failed")
        })();
        assert!(res.is_err());
        assert_eq!(pool.pooled(), 1);
        assert!(pool.get(MEDIUM_BUFFER_SIZE).capacity() >= MEDIUM_BUFFER_SIZE);
    }

    #[test]
    fn test_oversized_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        let buf = pool.get(LARGE_BUFFER_SIZE * 4);
        pool.put(buf);
        assert_eq!(pool.pooled(), 0);
    }
}
