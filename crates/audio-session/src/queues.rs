//! Buffer handoff between the writing thread and the event thread.
//!
//! Two FIFOs move [`PoolBuffer`] ownership around:
//! - `empty`: buffers ready to receive caller data
//! - `filled`: buffers sent to hardware, waiting for the period timer to retire them
//!
//! Each side has its own lock so the event thread can retire buffers while a
//! writer is parked. A blocked [`TransferQueues::pop_empty`] ends in one of three
//! ways: a buffer arrived, a skip was requested (flush), or the queues were
//! closed (stop).
//!
//! Lock order when both sides are needed: `filled`, then `empty`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::pool::PoolBuffer;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a blocking request for an empty buffer.
#[derive(Debug)]
pub enum PopEmpty {
    /// Ownership of a free buffer.
    Buffer(PoolBuffer),
    /// A skip was requested after the caller's token was taken; abandon the write.
    Skipped,
    /// The queues are closed for good.
    Closed,
}

/// Snapshot of the skip generation taken before a caller starts waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkipToken(u64);

/// Slot indices currently parked in each queue, in queue order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Census {
    pub empty: Vec<usize>,
    pub filled: Vec<usize>,
}

impl Census {
    pub fn total(&self) -> usize {
        self.empty.len() + self.filled.len()
    }
}

/// Outcome of retiring the oldest filled buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reclaimed {
    pub slot: usize,
    /// Filled buffers left after this one was retired.
    pub filled_remaining: usize,
}

struct EmptySide {
    queue: VecDeque<PoolBuffer>,
    skip_epoch: u64,
    closed: bool,
}

/// The empty/filled queue pair shared by a tunnel session and its event thread.
pub struct TransferQueues {
    empty: Mutex<EmptySide>,
    empty_cv: Condvar,
    filled: Mutex<VecDeque<PoolBuffer>>,
}

impl Default for TransferQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueues {
    pub fn new() -> Self {
        Self {
            empty: Mutex::new(EmptySide {
                queue: VecDeque::new(),
                skip_epoch: 0,
                closed: false,
            }),
            empty_cv: Condvar::new(),
            filled: Mutex::new(VecDeque::new()),
        }
    }

    /// Current skip generation. Take this before releasing any outer lock and
    /// waiting, so a skip raised in between is not missed.
    pub fn skip_token(&self) -> SkipToken {
        SkipToken(lock(&self.empty).skip_epoch)
    }

    /// Whether a skip was requested since `token` was taken.
    pub fn is_skipped(&self, token: SkipToken) -> bool {
        lock(&self.empty).skip_epoch != token.0
    }

    /// Wake every parked writer without a buffer.
    pub fn request_skip(&self) {
        let mut g = lock(&self.empty);
        g.skip_epoch = g.skip_epoch.wrapping_add(1);
        drop(g);
        self.empty_cv.notify_all();
    }

    /// Close the queues; pending and future blocking pops return [`PopEmpty::Closed`].
    ///
    /// Idempotent.
    pub fn close(&self) {
        let mut g = lock(&self.empty);
        g.closed = true;
        drop(g);
        self.empty_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.empty).closed
    }

    /// Return a buffer to the empty queue and wake one writer.
    pub fn push_empty(&self, buf: PoolBuffer) {
        lock(&self.empty).queue.push_back(buf);
        self.empty_cv.notify_one();
    }

    /// Take a free buffer if one is available right now.
    pub fn try_pop_empty(&self) -> Option<PoolBuffer> {
        lock(&self.empty).queue.pop_front()
    }

    /// Block until a free buffer is available, a skip newer than `token` is
    /// requested, or the queues are closed.
    ///
    /// There is no timeout: a stalled hardware path parks the caller until a
    /// flush or stop.
    pub fn pop_empty(&self, token: SkipToken) -> PopEmpty {
        let mut g = lock(&self.empty);
        loop {
            if g.closed {
                return PopEmpty::Closed;
            }
            if g.skip_epoch != token.0 {
                return PopEmpty::Skipped;
            }
            if let Some(buf) = g.queue.pop_front() {
                return PopEmpty::Buffer(buf);
            }
            g = self
                .empty_cv
                .wait(g)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stage a buffer that has been handed to hardware.
    pub fn push_filled(&self, buf: PoolBuffer) {
        lock(&self.filled).push_back(buf);
    }

    /// Take the oldest filled buffer, if any.
    pub fn pop_filled(&self) -> Option<PoolBuffer> {
        lock(&self.filled).pop_front()
    }

    /// Move the oldest filled buffer back to the empty queue in one step and
    /// wake a writer.
    ///
    /// Both locks are held across the move, so a concurrent [`Self::reset_all`]
    /// never observes the buffer outside the queues.
    pub fn reclaim_oldest(&self) -> Option<Reclaimed> {
        let mut filled = lock(&self.filled);
        let buf = filled.pop_front()?;
        let slot = buf.slot();
        let filled_remaining = filled.len();
        lock(&self.empty).queue.push_back(buf);
        drop(filled);
        self.empty_cv.notify_one();
        Some(Reclaimed {
            slot,
            filled_remaining,
        })
    }

    /// Zero every queued buffer and park all of them in the empty queue.
    ///
    /// Returns the number of buffers now in the empty queue.
    pub fn reset_all(&self) -> usize {
        let mut filled = lock(&self.filled);
        let mut empty = lock(&self.empty);
        let mut all: Vec<PoolBuffer> = empty.queue.drain(..).chain(filled.drain(..)).collect();
        all.sort_by_key(PoolBuffer::slot);
        for buf in &mut all {
            buf.clear();
        }
        empty.queue.extend(all);
        let count = empty.queue.len();
        drop(empty);
        drop(filled);
        self.empty_cv.notify_all();
        count
    }

    /// Remove every buffer from both queues.
    pub fn drain_all(&self) -> usize {
        let mut filled = lock(&self.filled);
        let mut empty = lock(&self.empty);
        let n = filled.len() + empty.queue.len();
        filled.clear();
        empty.queue.clear();
        n
    }

    pub fn len_empty(&self) -> usize {
        lock(&self.empty).queue.len()
    }

    pub fn len_filled(&self) -> usize {
        lock(&self.filled).len()
    }

    pub fn census(&self) -> Census {
        let filled = lock(&self.filled);
        let empty = lock(&self.empty);
        Census {
            empty: empty.queue.iter().map(PoolBuffer::slot).collect(),
            filled: filled.iter().map(PoolBuffer::slot).collect(),
        }
    }
}
