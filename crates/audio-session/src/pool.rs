//! Fixed-size pool of tunnel input buffers.
//!
//! All buffers are carved out of a single zeroed region at allocation time and
//! then only move between the transfer queues. Nothing is allocated or freed
//! while the stream is running.

use bytes::BytesMut;

use crate::error::{Result, SessionError};
use crate::queues::TransferQueues;

/// One slot of the pool: fixed capacity plus the number of valid bytes.
///
/// A `PoolBuffer` is an owned value, so at any time it lives in exactly one
/// place: the empty queue, the filled queue, or the hands of a thread that
/// popped it.
#[derive(Debug)]
pub struct PoolBuffer {
    slot: usize,
    data: BytesMut,
    len: usize,
}

impl PoolBuffer {
    /// Pool slot index, stable for the pool's lifetime.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid payload bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
        n
    }

    /// Valid payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole backing slot, including bytes past the valid payload.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// Zero the slot and mark it empty.
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }
}

/// Shape of an allocated pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPool {
    count: usize,
    buffer_bytes: usize,
}

impl BufferPool {
    /// Carve `count` zeroed buffers of `buffer_bytes` each out of one region and
    /// hand them all to the empty queue of `queues`.
    pub fn allocate(count: usize, buffer_bytes: usize, queues: &TransferQueues) -> Result<Self> {
        if count == 0 || buffer_bytes == 0 {
            return Err(SessionError::InvalidConfig(format!(
                "buffer pool needs a non-zero shape (count={count}, bytes={buffer_bytes})"
            )));
        }
        let total = count.checked_mul(buffer_bytes).ok_or_else(|| {
            SessionError::InvalidConfig(format!(
                "buffer pool too large ({count} x {buffer_bytes} bytes)"
            ))
        })?;

        let mut region = BytesMut::zeroed(total);
        for slot in 0..count {
            let data = region.split_to(buffer_bytes);
            queues.push_empty(PoolBuffer { slot, data, len: 0 });
        }
        tracing::debug!(count, buffer_bytes, "tunnel buffer pool allocated");

        Ok(Self {
            count,
            buffer_bytes,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Drop every buffer from both queues.
    ///
    /// Only valid once the writer and the event thread are stopped; buffers held
    /// elsewhere at that point are lost with their holder.
    pub fn release(self, queues: &TransferQueues) -> usize {
        let released = queues.drain_all();
        if released != self.count {
            tracing::warn!(
                expected = self.count,
                released,
                "buffer pool released with buffers outside the queues"
            );
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rejects_empty_shape() {
        let queues = TransferQueues::new();
        assert!(BufferPool::allocate(0, 16, &queues).is_err());
        assert!(BufferPool::allocate(4, 0, &queues).is_err());
        assert_eq!(queues.census().total(), 0);
    }

    #[test]
    fn allocate_fills_empty_queue_with_zeroed_slots() {
        let queues = TransferQueues::new();
        let pool = BufferPool::allocate(8, 32, &queues).unwrap();
        let census = queues.census();
        assert_eq!(census.empty, (0..8).collect::<Vec<_>>());
        assert!(census.filled.is_empty());

        let buf = queues.try_pop_empty().unwrap();
        assert_eq!(buf.capacity(), 32);
        assert!(buf.is_empty());
        assert!(buf.raw().iter().all(|b| *b == 0));
        queues.push_empty(buf);
        assert_eq!(pool.release(&queues), 8);
    }

    #[test]
    fn fill_from_truncates_to_capacity() {
        let queues = TransferQueues::new();
        let _pool = BufferPool::allocate(1, 4, &queues).unwrap();
        let mut buf = queues.try_pop_empty().unwrap();
        assert_eq!(buf.fill_from(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(buf.payload(), &[1, 2, 3, 4]);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.raw(), &[0, 0, 0, 0]);
    }

    #[test]
    fn buffer_round_trip_returns_zeroed_after_reset() {
        let queues = TransferQueues::new();
        let _pool = BufferPool::allocate(2, 8, &queues).unwrap();

        let mut buf = queues.try_pop_empty().unwrap();
        let slot = buf.slot();
        buf.fill_from(&[0xAA; 8]);
        queues.push_filled(buf);
        let buf = queues.pop_filled().unwrap();
        assert_eq!(buf.slot(), slot);
        queues.push_empty(buf);

        queues.reset_all();
        while let Some(buf) = queues.try_pop_empty() {
            assert!(buf.raw().iter().all(|b| *b == 0));
            assert_eq!(buf.len(), 0);
        }
    }
}
