//! Callbacks the session makes into its owner.

/// Receives end-of-stream notifications from the event thread.
pub trait EosObserver: Send + Sync {
    /// The last queued buffer of a stream has been consumed by hardware.
    /// `code` is 0 on a clean drain.
    fn notify_end_of_stream(&self, code: i32);
}

/// Platform wake lock held while the session is writing.
pub trait WakeLock: Send + Sync {
    fn acquire(&self, tag: &str);
    fn release(&self, tag: &str);
}

/// Wake lock that does nothing; for hosts without power management.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self, _tag: &str) {}
    fn release(&self, _tag: &str) {}
}
