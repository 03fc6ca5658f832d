//! Event thread for tunnel sessions.
//!
//! The thread waits on two sources:
//! - the control channel, owned by the session
//! - the period timer of the tunnel handle, once armed
//!
//! Every period tick retires the oldest filled buffer back to the empty queue.
//! When the filled queue runs dry after the writer signalled end of stream, the
//! observer is told once per flush cycle.
//!
//! Dropping the control sender (or sending [`ControlSignal::Terminate`]) ends
//! the thread; there is no other exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, select, unbounded};

use crate::hw::PeriodTick;
use crate::observer::EosObserver;
use crate::queues::{TransferQueues, lock};

/// Messages from the session to its event thread.
pub enum ControlSignal {
    /// Start tracking buffer completion on this period timer.
    Arm(Receiver<PeriodTick>),
    /// The writer queued its final (short) buffer.
    EndOfStream,
    Terminate,
}

/// Flags shared between the session and its event thread.
#[derive(Default)]
pub struct EventShared {
    pub tunnel_paused: AtomicBool,
    pub reached_eos: AtomicBool,
    eos_posted: AtomicBool,
    alive: AtomicBool,
    reclaimed: AtomicU64,
    observer: Mutex<Option<Arc<dyn EosObserver>>>,
}

impl EventShared {
    pub fn set_observer(&self, observer: Arc<dyn EosObserver>) {
        *lock(&self.observer) = Some(observer);
    }

    /// Notify the observer unless this flush cycle already did.
    pub fn post_eos(&self, code: i32) {
        if self.eos_posted.swap(true, Ordering::AcqRel) {
            return;
        }
        let observer = lock(&self.observer).clone();
        match observer {
            Some(o) => {
                tracing::debug!(code, "posting end of stream");
                o.notify_end_of_stream(code);
            }
            None => tracing::debug!(code, "end of stream with no observer"),
        }
    }

    /// Start a new flush cycle.
    pub fn reset_eos(&self) {
        self.reached_eos.store(false, Ordering::Release);
        self.eos_posted.store(false, Ordering::Release);
    }

    pub fn eos_posted(&self) -> bool {
        self.eos_posted.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Buffers retired by period ticks since the session opened.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

/// Handle to a running event thread.
pub struct EventThread {
    control: Option<Sender<ControlSignal>>,
    join: Option<JoinHandle<()>>,
}

impl EventThread {
    pub fn spawn(queues: Arc<TransferQueues>, shared: Arc<EventShared>) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        shared.alive.store(true, Ordering::Release);
        let shared_thread = shared.clone();
        let join = thread::Builder::new()
            .name("session-events".to_string())
            .spawn(move || {
                event_loop(&rx, &queues, &shared_thread);
                shared_thread.alive.store(false, Ordering::Release);
            });
        let join = match join {
            Ok(j) => j,
            Err(e) => {
                shared.alive.store(false, Ordering::Release);
                return Err(e);
            }
        };
        tracing::debug!("event thread started");
        Ok(Self {
            control: Some(tx),
            join: Some(join),
        })
    }

    fn send(&self, signal: ControlSignal) -> bool {
        self.control
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    /// Begin retiring buffers on `timer` ticks.
    pub fn arm(&self, timer: Receiver<PeriodTick>) -> bool {
        self.send(ControlSignal::Arm(timer))
    }

    pub fn signal_end_of_stream(&self) -> bool {
        self.send(ControlSignal::EndOfStream)
    }

    /// Stop the thread and wait for it to exit. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.control.take() {
            let _ = tx.send(ControlSignal::Terminate);
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("event thread panicked");
            }
            tracing::debug!("event thread joined");
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Wake {
    Control(Option<ControlSignal>),
    Tick(bool),
}

fn event_loop(control: &Receiver<ControlSignal>, queues: &TransferQueues, shared: &EventShared) {
    let mut timer: Option<Receiver<PeriodTick>> = None;
    loop {
        let wake = match timer.clone() {
            None => Wake::Control(control.recv().ok()),
            Some(t) => select! {
                recv(control) -> msg => Wake::Control(msg.ok()),
                recv(t) -> tick => Wake::Tick(tick.is_ok()),
            },
        };

        match wake {
            Wake::Control(Some(ControlSignal::Arm(t))) => {
                tracing::debug!("event thread armed");
                timer = Some(t);
            }
            Wake::Control(Some(ControlSignal::EndOfStream)) => {
                shared.reached_eos.store(true, Ordering::Release);
                // The final buffer may already have been retired.
                if queues.len_filled() == 0 && !shared.tunnel_paused.load(Ordering::Acquire) {
                    shared.post_eos(0);
                }
            }
            Wake::Control(Some(ControlSignal::Terminate)) | Wake::Control(None) => break,
            Wake::Tick(true) => on_period(queues, shared),
            Wake::Tick(false) => {
                tracing::debug!("period timer closed; waiting for re-arm");
                timer = None;
            }
        }
    }
    tracing::debug!("event thread exiting");
}

fn on_period(queues: &TransferQueues, shared: &EventShared) {
    if shared.tunnel_paused.load(Ordering::Acquire) {
        return;
    }
    let Some(reclaimed) = queues.reclaim_oldest() else {
        if shared.reached_eos.load(Ordering::Acquire) {
            shared.post_eos(0);
        }
        return;
    };
    shared.reclaimed.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(
        slot = reclaimed.slot,
        filled = reclaimed.filled_remaining,
        "buffer retired"
    );
    if reclaimed.filled_remaining == 0 && shared.reached_eos.load(Ordering::Acquire) {
        shared.post_eos(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingObserver {
        calls: AtomicUsize,
    }

    impl EosObserver for CountingObserver {
        fn notify_end_of_stream(&self, _code: i32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn setup(count: usize) -> (Arc<TransferQueues>, Arc<EventShared>, EventThread) {
        let queues = Arc::new(TransferQueues::new());
        BufferPool::allocate(count, 8, &queues).unwrap();
        let shared = Arc::new(EventShared::default());
        let thread = EventThread::spawn(queues.clone(), shared.clone()).unwrap();
        (queues, shared, thread)
    }

    fn queue_filled(queues: &TransferQueues, n: usize) {
        for _ in 0..n {
            let b = queues.try_pop_empty().unwrap();
            queues.push_filled(b);
        }
    }

    #[test]
    fn tick_retires_oldest_filled_buffer() {
        let (queues, shared, thread) = setup(4);
        queue_filled(&queues, 2);
        let (tick_tx, tick_rx) = unbounded();
        assert!(thread.arm(tick_rx));

        tick_tx.send(PeriodTick).unwrap();
        assert!(wait_until(|| queues.len_filled() == 1));
        assert_eq!(queues.census().empty, vec![2, 3, 0]);
        assert_eq!(shared.reclaimed(), 1);
    }

    #[test]
    fn paused_ticks_do_not_retire() {
        let (queues, shared, thread) = setup(2);
        queue_filled(&queues, 1);
        shared.tunnel_paused.store(true, Ordering::SeqCst);
        let (tick_tx, tick_rx) = unbounded();
        thread.arm(tick_rx);
        tick_tx.send(PeriodTick).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queues.len_filled(), 1);

        shared.tunnel_paused.store(false, Ordering::SeqCst);
        tick_tx.send(PeriodTick).unwrap();
        assert!(wait_until(|| queues.len_filled() == 0));
    }

    #[test]
    fn eos_posted_once_when_filled_drains() {
        let (queues, shared, thread) = setup(4);
        let observer = Arc::new(CountingObserver::default());
        shared.set_observer(observer.clone());
        queue_filled(&queues, 2);

        let (tick_tx, tick_rx) = unbounded();
        thread.arm(tick_rx);
        thread.signal_end_of_stream();
        for _ in 0..4 {
            tick_tx.send(PeriodTick).unwrap();
        }
        assert!(wait_until(|| observer.calls.load(Ordering::SeqCst) == 1));

        // Another drained buffer in the same cycle does not re-notify.
        queue_filled(&queues, 1);
        tick_tx.send(PeriodTick).unwrap();
        assert!(wait_until(|| queues.len_filled() == 0));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);

        shared.reset_eos();
        assert!(!shared.eos_posted());
    }

    #[test]
    fn no_eos_without_end_of_stream_signal() {
        let (queues, shared, thread) = setup(2);
        let observer = Arc::new(CountingObserver::default());
        shared.set_observer(observer.clone());
        queue_filled(&queues, 1);
        let (tick_tx, tick_rx) = unbounded();
        thread.arm(tick_rx);
        tick_tx.send(PeriodTick).unwrap();
        assert!(wait_until(|| queues.len_filled() == 0));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_joins_idle_and_armed_threads() {
        let (_queues, shared, mut idle) = setup(1);
        idle.shutdown();
        assert!(!shared.is_alive());
        idle.shutdown();

        let (_queues, shared, mut armed) = setup(1);
        let (_tick_tx, tick_rx) = unbounded();
        armed.arm(tick_rx);
        drop(armed.control.take());
        armed.shutdown();
        assert!(!shared.is_alive());
    }
}
