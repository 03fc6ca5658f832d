//! CPAL-backed PCM driver.
//!
//! Each handle owns a bounded 16-bit sample queue and an output stream running
//! on its own thread (CPAL streams are not `Send` on every host). The stream
//! callback drains the queue without blocking, fills underruns with silence and
//! fires one [`PeriodTick`] per period of frames consumed.
//!
//! Only the PCM use case is supported; compressed tunnel playback needs a DSP.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use audio_session::config::STREAM_VOLUME_MAX;
use audio_session::hw::{
    HandleParams, HardwareDriver, PcmHandle, PeriodTick, UseCase, UseCaseSlot, VERB_INACTIVE,
};
use audio_session::{DeviceMask, HwError};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::device;

/// Frames per hardware period reported to the session.
const PERIOD_FRAMES: usize = 1024;
/// Queue depth in periods; writes block beyond this.
const QUEUE_PERIODS: usize = 8;

/// Bounded interleaved `i16` queue between the writer and the stream callback.
pub(crate) struct SampleQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
    capacity: usize,
}

struct QueueInner {
    samples: VecDeque<i16>,
    closed: bool,
}

impl SampleQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                samples: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cv: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue all of `samples`, waiting for room. Returns false if the queue
    /// was closed first.
    pub(crate) fn push_blocking(&self, mut samples: &[i16]) -> bool {
        let mut g = self.lock();
        while !samples.is_empty() {
            while !g.closed && g.samples.len() >= self.capacity {
                g = self
                    .cv
                    .wait_timeout(g, Duration::from_millis(50))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            if g.closed {
                return false;
            }
            let n = (self.capacity - g.samples.len()).min(samples.len());
            g.samples.extend(&samples[..n]);
            samples = &samples[n..];
        }
        true
    }

    /// Move up to `out.len()` samples into `out` without waiting.
    pub(crate) fn pop_into(&self, out: &mut [i16]) -> usize {
        let mut g = self.lock();
        let n = out.len().min(g.samples.len());
        for (dst, src) in out.iter_mut().zip(g.samples.drain(..n)) {
            *dst = src;
        }
        drop(g);
        if n > 0 {
            self.cv.notify_all();
        }
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub(crate) fn clear(&self) {
        self.lock().samples.clear();
        self.cv.notify_all();
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    pub(crate) fn reopen(&self) {
        let mut g = self.lock();
        g.samples.clear();
        g.closed = false;
    }
}

/// Source channel feeding output channel `out` (mono is duplicated, extra
/// output channels get silence).
fn source_channel(out: usize, src_channels: usize) -> Option<usize> {
    if out < src_channels {
        Some(out)
    } else if src_channels == 1 {
        Some(0)
    } else {
        None
    }
}

struct StreamControl {
    paused: AtomicBool,
    gain_bits: AtomicU32,
}

impl StreamControl {
    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }
}

struct StreamThread {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

/// Driver opening one CPAL output stream per PCM handle.
pub struct CpalDriver {
    device: Option<String>,
    verb: Arc<Mutex<Option<String>>>,
}

impl CpalDriver {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            verb: Arc::new(Mutex::new(None)),
        }
    }
}

impl HardwareDriver for CpalDriver {
    fn open(&self, params: &HandleParams) -> Result<Box<dyn PcmHandle>, HwError> {
        if params.use_case != UseCase::Pcm {
            return Err(HwError::Unsupported(
                "cpal sink renders linear pcm only".to_string(),
            ));
        }
        let channels = params.channels.max(1) as usize;
        let (tick_tx, tick_rx) = unbounded();
        let mut handle = CpalHandle {
            params: params.clone(),
            device: self.device.clone(),
            verb: self.verb.clone(),
            queue: Arc::new(SampleQueue::new(PERIOD_FRAMES * QUEUE_PERIODS * channels)),
            control: Arc::new(StreamControl {
                paused: AtomicBool::new(false),
                gain_bits: AtomicU32::new(1.0f32.to_bits()),
            }),
            tick_tx,
            tick_rx,
            stream: None,
            started: false,
        };
        handle.spawn_stream()?;
        if params.slot == UseCaseSlot::Verb {
            *self.verb.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(params.use_case.verb().to_string());
        }
        Ok(Box::new(handle))
    }

    fn current_verb(&self) -> Option<String> {
        self.verb.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn route(&self, handle: &mut dyn PcmHandle, devices: DeviceMask) -> Result<(), HwError> {
        tracing::info!(%devices, "cpal sink keeps its output device; recording route only");
        handle.set_devices(devices);
        Ok(())
    }

    fn set_spdif_channel_status(&self, sample_rate: u32) -> Result<(), HwError> {
        tracing::debug!(sample_rate, "no spdif channel status on cpal sink");
        Ok(())
    }
}

struct CpalHandle {
    params: HandleParams,
    device: Option<String>,
    verb: Arc<Mutex<Option<String>>>,
    queue: Arc<SampleQueue>,
    control: Arc<StreamControl>,
    tick_tx: Sender<PeriodTick>,
    tick_rx: Receiver<PeriodTick>,
    stream: Option<StreamThread>,
    started: bool,
}

impl CpalHandle {
    fn spawn_stream(&mut self) -> Result<(), HwError> {
        let (ready_tx, ready_rx) = bounded::<Result<(), HwError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device = self.device.clone();
        let params = self.params.clone();
        let queue = self.queue.clone();
        let control = self.control.clone();
        let tick_tx = self.tick_tx.clone();

        let join = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let stream = match build_stream(device.as_deref(), &params, queue, control, tick_tx)
                {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(HwError::Unsupported(format!("play: {e}"))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Keep the stream alive until asked to stop.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| HwError::Unsupported(format!("spawn output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stream = Some(StreamThread {
                    stop: stop_tx,
                    join,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(HwError::Failed(-1))
            }
        }
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.stop.send(());
            if stream.join.join().is_err() {
                tracing::error!("cpal output thread panicked");
            }
        }
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        self.queue.close();
        self.stop_stream();
    }
}

impl PcmHandle for CpalHandle {
    fn params(&self) -> &HandleParams {
        &self.params
    }

    fn period_bytes(&self) -> usize {
        PERIOD_FRAMES * self.params.channels.max(1) as usize * 2
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, HwError> {
        if self.stream.is_none() {
            return Err(HwError::Closed);
        }
        let samples: Vec<i16> = data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if !self.queue.push_blocking(&samples) {
            return Err(HwError::BadState);
        }
        self.started = true;
        Ok(samples.len() * 2)
    }

    fn start(&mut self) -> Result<(), HwError> {
        self.control.paused.store(false, Ordering::Relaxed);
        self.started = true;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn pause(&mut self, paused: bool) -> Result<(), HwError> {
        self.control.paused.store(paused, Ordering::Relaxed);
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), HwError> {
        self.queue.clear();
        self.started = false;
        Ok(())
    }

    fn standby(&mut self) -> Result<(), HwError> {
        self.queue.clear();
        self.started = false;
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), HwError> {
        self.stop_stream();
        self.queue.reopen();
        self.started = false;
        self.spawn_stream()
    }

    fn close(&mut self) -> Result<(), HwError> {
        self.queue.close();
        self.stop_stream();
        if self.params.slot == UseCaseSlot::Verb {
            *self.verb.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(VERB_INACTIVE.to_string());
        }
        Ok(())
    }

    fn latency_micros(&self) -> u32 {
        let channels = self.params.channels.max(1) as u64;
        let rate = u64::from(self.params.sample_rate.max(1));
        let queued_frames = self.queue.len() as u64 / channels;
        let queued_us = queued_frames * 1_000_000 / rate;
        u32::try_from(queued_us)
            .unwrap_or(u32::MAX)
            .saturating_add(self.params.latency_us)
    }

    fn period_timer(&self) -> Option<Receiver<PeriodTick>> {
        Some(self.tick_rx.clone())
    }

    fn set_devices(&mut self, devices: DeviceMask) {
        self.params.devices = devices;
    }

    fn set_volume(&mut self, volume: u32) -> Result<(), HwError> {
        let gain = volume.min(STREAM_VOLUME_MAX) as f32 / STREAM_VOLUME_MAX as f32;
        self.control.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

fn build_stream(
    device_name: Option<&str>,
    params: &HandleParams,
    queue: Arc<SampleQueue>,
    control: Arc<StreamControl>,
    tick_tx: Sender<PeriodTick>,
) -> Result<cpal::Stream, HwError> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, device_name)
        .map_err(|e| HwError::Unsupported(format!("{e:#}")))?;
    let supported = device
        .default_output_config()
        .map_err(|e| HwError::Unsupported(format!("default output config: {e}")))?;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: params.sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let src_channels = params.channels.max(1) as usize;
    tracing::info!(
        device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
        rate_hz = params.sample_rate,
        device_channels = config.channels,
        src_channels,
        "opening cpal output stream"
    );
    match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            build_typed::<f32>(&device, &config, src_channels, queue, control, tick_tx)
        }
        cpal::SampleFormat::I16 => {
            build_typed::<i16>(&device, &config, src_channels, queue, control, tick_tx)
        }
        cpal::SampleFormat::I32 => {
            build_typed::<i32>(&device, &config, src_channels, queue, control, tick_tx)
        }
        cpal::SampleFormat::U16 => {
            build_typed::<u16>(&device, &config, src_channels, queue, control, tick_tx)
        }
        other => Err(HwError::Unsupported(format!("sample format {other:?}"))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    src_channels: usize,
    queue: Arc<SampleQueue>,
    control: Arc<StreamControl>,
    tick_tx: Sender<PeriodTick>,
) -> Result<cpal::Stream, HwError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let out_channels = usize::from(config.channels).max(1);
    let mut scratch: Vec<i16> = Vec::new();
    let mut consumed_frames = 0usize;
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let err_fn = |err| tracing::warn!("stream error: {err}");
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let frames = data.len() / out_channels;
                if control.paused.load(Ordering::Relaxed) {
                    data.fill(silence);
                    return;
                }
                scratch.resize(frames * src_channels, 0);
                let got_frames = queue.pop_into(&mut scratch) / src_channels;
                let gain = control.gain();

                for frame in 0..frames {
                    for ch in 0..out_channels {
                        let sample = match source_channel(ch, src_channels) {
                            Some(src) if frame < got_frames => {
                                f32::from(scratch[frame * src_channels + src]) / 32768.0 * gain
                            }
                            _ => 0.0,
                        };
                        data[frame * out_channels + ch] =
                            <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                }

                consumed_frames += got_frames;
                while consumed_frames >= PERIOD_FRAMES {
                    consumed_frames -= PERIOD_FRAMES;
                    let _ = tick_tx.send(PeriodTick);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| HwError::Unsupported(format!("build output stream: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_returns_queued_samples_in_order() {
        let q = SampleQueue::new(8);
        assert!(q.push_blocking(&[1, 2, 3]));
        let mut out = [0i16; 2];
        assert_eq!(q.pop_into(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn push_waits_for_room() {
        let q = Arc::new(SampleQueue::new(4));
        assert!(q.push_blocking(&[0; 4]));
        let q_push = q.clone();
        let pusher = thread::spawn(move || q_push.push_blocking(&[5; 4]));
        thread::sleep(Duration::from_millis(20));
        assert!(!pusher.is_finished());

        let mut out = [0i16; 4];
        q.pop_into(&mut out);
        assert!(pusher.join().unwrap());
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn close_releases_blocked_push() {
        let q = Arc::new(SampleQueue::new(2));
        assert!(q.push_blocking(&[0; 2]));
        let q_push = q.clone();
        let pusher = thread::spawn(move || q_push.push_blocking(&[1; 2]));
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!pusher.join().unwrap());

        q.reopen();
        assert_eq!(q.len(), 0);
        assert!(q.push_blocking(&[1]));
    }

    #[test]
    fn channel_mapping_duplicates_mono_only() {
        assert_eq!(source_channel(1, 1), Some(0));
        assert_eq!(source_channel(1, 2), Some(1));
        assert_eq!(source_channel(3, 2), None);
    }

    #[test]
    fn tunnel_use_case_is_rejected() {
        let driver = CpalDriver::new(None);
        let params = HandleParams {
            use_case: UseCase::Tunnel,
            slot: UseCaseSlot::Verb,
            devices: DeviceMask::SPEAKER,
            sample_rate: 48_000,
            channels: 2,
            format: audio_session::hw::SampleFormat::Compressed(audio_session::AudioFormat::Mp3),
            buffer_bytes: 4800,
            latency_us: 0,
        };
        assert!(matches!(driver.open(&params), Err(HwError::Unsupported(_))));
    }
}
