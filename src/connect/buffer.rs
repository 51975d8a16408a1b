//! Relay buffers.

use std::sync::Mutex;

/// Largest payload a single frame may carry on framed transports the proxy
/// runs over. Relay reads never exceed it, so one read maps to at most one frame.
pub const MAX_DATA_LEN: usize = 8192;

/// Source of byte buffers for the relay.
///
/// Buffers from `get` are at least [`MAX_DATA_LEN`] long. A buffer handed to
/// `put` belongs to the source again and must not be touched by the caller.
pub trait BufferSource: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

/// Allocates a fresh buffer every time; returned buffers are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBufferSource;

impl BufferSource for DefaultBufferSource {
    fn get(&self) -> Vec<u8> {
        vec![0; MAX_DATA_LEN]
    }

    fn put(&self, _buf: Vec<u8>) {}
}

/// Keeps up to `capacity` returned buffers for reuse.
#[derive(Debug)]
pub struct PooledBufferSource {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl PooledBufferSource {
    /// Create a pool that keeps at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl BufferSource for PooledBufferSource {
    fn get(&self) -> Vec<u8> {
        let reused = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        reused.unwrap_or_else(|| vec![0; MAX_DATA_LEN])
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.len() < MAX_DATA_LEN {
            return;
        }
        // Oversized buffers come back frame sized.
        buf.truncate(MAX_DATA_LEN);
        buf.shrink_to_fit();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_source_hands_out_full_size_buffers() {
        let source = DefaultBufferSource;
        let buf = source.get();
        assert_eq!(buf.len(), MAX_DATA_LEN);
        source.put(buf);
    }

    #[test]
    fn pool_reuses_up_to_capacity() {
        let pool = PooledBufferSource::new(1);
        let a = pool.get();
        let b = pool.get();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle(), 1);

        let c = pool.get();
        assert_eq!(c.len(), MAX_DATA_LEN);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_trims_oversized_buffers() {
        let pool = PooledBufferSource::new(2);
        pool.put(vec![0; 1 << 20]);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.get().len(), MAX_DATA_LEN);
    }

    #[test]
    fn pool_rejects_undersized_buffers() {
        let pool = PooledBufferSource::new(4);
        pool.put(vec![0; 16]);
        assert_eq!(pool.idle(), 0);
    }
}
