//! Bridge from the proxy capture port to an A2DP output stream.
//!
//! While routed to Bluetooth, the session renders to the proxy port. This
//! thread reads whole proxy periods until the A2DP buffer is as full as it can
//! get, then writes the batch to the A2DP stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::HwError;
use crate::hw::CaptureHandle;

/// Pause after a failed proxy read before starting the next batch.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// An open A2DP output stream.
pub trait A2dpStream: Send {
    /// Preferred write size in bytes.
    fn buffer_bytes(&self) -> usize;

    fn write(&mut self, data: &[u8]) -> Result<usize, HwError>;
}

/// Source of A2DP output streams.
pub trait A2dpOutput: Send + Sync {
    fn open_stream(&self) -> Result<Box<dyn A2dpStream>, HwError>;
}

/// Running bridge thread. Owns the capture handle until stopped.
pub struct A2dpBridge {
    exit: Arc<AtomicBool>,
    join: Option<JoinHandle<Box<dyn CaptureHandle>>>,
}

impl A2dpBridge {
    pub fn start(
        capture: Box<dyn CaptureHandle>,
        stream: Box<dyn A2dpStream>,
    ) -> std::io::Result<Self> {
        let exit = Arc::new(AtomicBool::new(false));
        let exit_thread = exit.clone();
        let join = thread::Builder::new()
            .name("a2dp-bridge".to_string())
            .spawn(move || bridge_loop(capture, stream, &exit_thread))?;
        tracing::info!("a2dp bridge started");
        Ok(Self {
            exit,
            join: Some(join),
        })
    }

    /// Stop the thread and take back the capture handle.
    pub fn stop(mut self) -> Option<Box<dyn CaptureHandle>> {
        self.exit.store(true, Ordering::Release);
        let join = self.join.take()?;
        match join.join() {
            Ok(capture) => {
                tracing::info!("a2dp bridge stopped");
                Some(capture)
            }
            Err(_) => {
                tracing::error!("a2dp bridge thread panicked");
                None
            }
        }
    }
}

impl Drop for A2dpBridge {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if let Ok(mut capture) = join.join() {
                capture.close();
            }
        }
    }
}

fn bridge_loop(
    mut capture: Box<dyn CaptureHandle>,
    mut stream: Box<dyn A2dpStream>,
    exit: &AtomicBool,
) -> Box<dyn CaptureHandle> {
    let period = capture.period_bytes().max(1);
    let batch = stream.buffer_bytes().max(period);
    let mut buf = vec![0u8; batch];

    'batches: while !exit.load(Ordering::Acquire) {
        let mut filled = 0;
        while batch - filled >= period {
            if let Err(e) = capture.read(&mut buf[filled..filled + period]) {
                // Drop the partial batch rather than forward stale bytes.
                tracing::warn!("proxy read failed: {e}");
                thread::sleep(READ_RETRY_DELAY);
                continue 'batches;
            }
            filled += period;
        }
        match stream.write(&buf[..filled]) {
            Ok(n) if n < filled => tracing::debug!(written = n, filled, "short a2dp write"),
            Ok(_) => {}
            Err(e) => tracing::warn!("a2dp write failed: {e}"),
        }
    }
    capture
}
