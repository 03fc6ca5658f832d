//! Output session: one open output stream and its hardware resources.
//!
//! A session picks one write strategy at open time from the requested format
//! and channel count:
//! - tunnel: compressed data queued to the DSP through the buffer pool
//! - decode chain: software decode (or downmix) feeding a PCM handle
//! - direct PCM: caller data written straight to a PCM handle
//!
//! All entry points serialize on one session lock. A tunnel writer waiting for
//! a free buffer releases that lock, so flush and stop can always get in.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::a2dp::{A2dpBridge, A2dpOutput, A2dpStream};
use crate::config::{
    AAC_BLOCK_PER_CHANNEL, PCM_BLOCK_PER_CHANNEL, STREAM_VOLUME_MAX, SessionConfig,
};
use crate::decode::{DecodeAdapter, DecoderProvider, OutputFormat};
use crate::decoders::BuiltinDecoders;
use crate::error::{HwError, Result, SessionError};
use crate::event::{EventShared, EventThread};
use crate::format::{AudioFormat, CodecKind, DeviceMask};
use crate::hw::{CaptureHandle, HandleParams, HardwareDriver, PcmHandle};
use crate::observer::{EosObserver, NoWakeLock, WakeLock};
use crate::params::{KEY_ROUTING, Params};
use crate::pool::BufferPool;
use crate::queues::{TransferQueues, lock};

const WAKE_LOCK_TAG: &str = "audio-session";

/// What the caller asks to open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    pub format: AudioFormat,
    pub channels: u32,
    pub sample_rate: u32,
    pub devices: DeviceMask,
    pub session_id: i32,
}

/// Collaborators a session needs from its host.
#[derive(Clone)]
pub struct SessionEnv {
    pub driver: Arc<dyn HardwareDriver>,
    pub decoders: Arc<dyn DecoderProvider>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub a2dp: Option<Arc<dyn A2dpOutput>>,
    pub config: SessionConfig,
}

impl SessionEnv {
    /// Environment with the built-in decoders, no wake lock and no A2DP output.
    pub fn new(driver: Arc<dyn HardwareDriver>) -> Self {
        Self {
            driver,
            decoders: Arc::new(BuiltinDecoders),
            wake_lock: Arc::new(NoWakeLock),
            a2dp: None,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_decoders(mut self, decoders: Arc<dyn DecoderProvider>) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_wake_lock(mut self, wake_lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn with_a2dp(mut self, a2dp: Arc<dyn A2dpOutput>) -> Self {
        self.a2dp = Some(a2dp);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    Configured,
    Running,
    Paused,
    Flushing,
    Stopped,
}

/// Write strategy selected at open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    Unconfigured,
    Tunnel,
    DecodeChain,
    DirectPcm,
}

/// Where rendered audio goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Routes {
    pub pcm: bool,
    pub pcm_to_spdif: bool,
    pub compressed_to_spdif: bool,
    pub capture_from_proxy: bool,
    pub a2dp: bool,
}

/// Decode-chain sub-state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeState {
    Decoding,
    /// Output format changed; the PCM handle is being reopened.
    Reconfiguring { from: OutputFormat, to: OutputFormat },
}

pub(crate) struct TunnelPath {
    pub config_pending: bool,
    pub armed: bool,
    pub pool: Option<BufferPool>,
    pub eos_signalled: bool,
    pub seeking: bool,
}

pub(crate) struct DecodePath {
    pub adapter: DecodeAdapter,
    pub state: DecodeState,
    pub empty_decodes: u64,
}

pub(crate) enum SessionMode {
    Unconfigured,
    Tunnel(TunnelPath),
    DecodeChain(DecodePath),
    DirectPcm,
}

impl SessionMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            SessionMode::Unconfigured => ModeKind::Unconfigured,
            SessionMode::Tunnel(_) => ModeKind::Tunnel,
            SessionMode::DecodeChain(_) => ModeKind::DecodeChain,
            SessionMode::DirectPcm => ModeKind::DirectPcm,
        }
    }
}

/// Negotiated stream shape. Rate and channels follow the PCM handle after a
/// decoder format change.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamShape {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u32,
    pub devices: DeviceMask,
    pub session_id: i32,
}

pub(crate) enum ProxySlot {
    Closed,
    Idle(Box<dyn CaptureHandle>),
    Bridging(A2dpBridge),
}

pub(crate) struct SessionInner {
    pub shape: StreamShape,
    pub state: SessionState,
    pub mode: SessionMode,
    pub routes: Routes,
    pub pcm: Option<Box<dyn PcmHandle>>,
    pub tunnel: Option<Box<dyn PcmHandle>>,
    pub proxy: ProxySlot,
    pub a2dp_stream: Option<Box<dyn A2dpStream>>,
    pub event: Option<EventThread>,
    pub frame_count: u64,
    pub wake_lock_held: bool,
    pub stream_volume: u32,
}

/// One open output stream.
pub struct OutputSession {
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) queues: Arc<TransferQueues>,
    pub(crate) events: Arc<EventShared>,
    pub(crate) env: SessionEnv,
}

impl OutputSession {
    /// Validate `request`, pick the write strategy and open hardware.
    ///
    /// On failure every resource opened so far is released.
    pub fn open(env: SessionEnv, request: SessionRequest) -> Result<Self> {
        let cfg = &env.config;
        if request.devices.is_empty() {
            return Err(SessionError::InvalidConfig(
                "no output device requested".to_string(),
            ));
        }
        if request.format == AudioFormat::Pcm16
            && (request.channels == 0 || request.channels > cfg.max_pcm_channels)
        {
            return Err(SessionError::InvalidConfig(format!(
                "unsupported pcm channel count {}",
                request.channels
            )));
        }

        let mut devices = request.devices;
        if cfg.force_spdif {
            devices = devices.union(DeviceMask::SPDIF);
        }

        let (sample_rate, channels) = if request.format.is_dolby_digital() {
            (48_000, 2)
        } else if request.sample_rate > cfg.max_sample_rate {
            tracing::warn!(
                requested = request.sample_rate,
                max = cfg.max_sample_rate,
                "capping sample rate"
            );
            (cfg.max_sample_rate, request.channels)
        } else {
            (request.sample_rate, request.channels)
        };

        let mut routes = Routes::default();
        if devices.intersects(DeviceMask::ALL_A2DP) {
            routes.capture_from_proxy = true;
            routes.a2dp = true;
            devices = devices.without(DeviceMask::ALL_A2DP).union(DeviceMask::PROXY);
        }
        let has_spdif = devices.intersects(DeviceMask::SPDIF);
        let has_analog = !devices.without(DeviceMask::SPDIF).is_empty();

        let format = request.format;
        let mode = if let Some(codec) = format.decode_codec() {
            let mut decoder = env.decoders.create(codec)?;
            decoder.configure(codec, channels, sample_rate)?;
            let min_bytes = if format == AudioFormat::AacAdif {
                (AAC_BLOCK_PER_CHANNEL * channels as usize).saturating_sub(1)
            } else {
                0
            };
            routes.pcm = has_analog;
            routes.pcm_to_spdif = has_spdif;
            SessionMode::DecodeChain(DecodePath {
                adapter: DecodeAdapter::new(
                    decoder,
                    min_bytes,
                    OutputFormat {
                        sample_rate,
                        channels,
                    },
                    format.is_aac_family(),
                ),
                state: DecodeState::Decoding,
                empty_decodes: 0,
            })
        } else if format.is_tunnel_decoded() {
            if devices.intersects(DeviceMask::PROXY) {
                routes.capture_from_proxy = true;
            }
            SessionMode::Tunnel(TunnelPath {
                config_pending: format == AudioFormat::Wma,
                armed: false,
                pool: None,
                eos_signalled: false,
                seeking: false,
            })
        } else if format == AudioFormat::Pcm16 {
            routes.pcm = has_analog;
            let min_bytes = (PCM_BLOCK_PER_CHANNEL * channels as usize).saturating_sub(1);
            if channels > 2 {
                let codec = CodecKind::ExternalPcm;
                let mut decoder = env.decoders.create(codec)?;
                decoder.configure(codec, channels, sample_rate)?;
                routes.compressed_to_spdif = has_spdif;
                SessionMode::DecodeChain(DecodePath {
                    adapter: DecodeAdapter::new(
                        decoder,
                        min_bytes,
                        OutputFormat {
                            sample_rate,
                            channels,
                        },
                        false,
                    ),
                    state: DecodeState::Decoding,
                    empty_decodes: 0,
                })
            } else {
                routes.pcm_to_spdif = has_spdif;
                SessionMode::DirectPcm
            }
        } else {
            return Err(SessionError::UnsupportedFormat(format));
        };

        tracing::info!(
            %format,
            sample_rate,
            channels,
            %devices,
            session_id = request.session_id,
            mode = ?mode.kind(),
            "opening output session"
        );

        let session = Self {
            inner: Mutex::new(SessionInner {
                shape: StreamShape {
                    format,
                    sample_rate,
                    channels,
                    devices,
                    session_id: request.session_id,
                },
                state: SessionState::Created,
                mode,
                routes,
                pcm: None,
                tunnel: None,
                proxy: ProxySlot::Closed,
                a2dp_stream: None,
                event: None,
                frame_count: 0,
                wake_lock_held: false,
                stream_volume: STREAM_VOLUME_MAX,
            }),
            queues: Arc::new(TransferQueues::new()),
            events: Arc::new(EventShared::default()),
            env,
        };
        // Dropping `session` on error tears down whatever was opened.
        session.bring_up()?;
        Ok(session)
    }

    fn bring_up(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        if inner.routes.pcm {
            inner.pcm = Some(self.open_pcm_handle(&inner.shape, &inner.routes)?);
        }
        if let SessionMode::Tunnel(path) = &mut inner.mode {
            inner.event = Some(EventThread::spawn(
                self.queues.clone(),
                self.events.clone(),
            )?);
            if !path.config_pending {
                self.open_tunnel_handle(&mut inner.tunnel, path, &inner.shape, &inner.routes)?;
            }
        }
        if inner.routes.compressed_to_spdif {
            tracing::debug!("compressed spdif output requested; rendering pcm only");
        }
        if inner.routes.capture_from_proxy {
            let capture = self
                .env
                .driver
                .open_proxy_capture(self.env.config.proxy_period_bytes)?;
            inner.proxy = ProxySlot::Idle(capture);
            if inner.routes.a2dp {
                inner.a2dp_stream = Some(self.open_a2dp_stream()?);
            }
        }
        inner.state = SessionState::Configured;
        Ok(())
    }

    pub(crate) fn open_a2dp_stream(&self) -> Result<Box<dyn A2dpStream>> {
        let output = self.env.a2dp.as_ref().ok_or(SessionError::NoDevice("a2dp"))?;
        Ok(output.open_stream()?)
    }

    /// Hand the idle proxy capture and the pending A2DP stream to a bridge
    /// thread. No-op when already bridging or either side is missing.
    pub(crate) fn start_a2dp_bridge(&self, inner: &mut SessionInner) -> Result<()> {
        let slot = std::mem::replace(&mut inner.proxy, ProxySlot::Closed);
        match (slot, inner.a2dp_stream.take()) {
            (ProxySlot::Idle(capture), Some(stream)) => {
                inner.proxy = ProxySlot::Bridging(A2dpBridge::start(capture, stream)?);
            }
            (slot, stream) => {
                inner.proxy = slot;
                inner.a2dp_stream = stream;
            }
        }
        Ok(())
    }

    fn close_proxy(&self, inner: &mut SessionInner) {
        match std::mem::replace(&mut inner.proxy, ProxySlot::Closed) {
            ProxySlot::Bridging(bridge) => {
                if let Some(mut capture) = bridge.stop() {
                    capture.close();
                }
            }
            ProxySlot::Idle(mut capture) => capture.close(),
            ProxySlot::Closed => {}
        }
        inner.a2dp_stream = None;
    }

    pub(crate) fn acquire_wake_lock(&self, inner: &mut SessionInner) {
        if !inner.wake_lock_held {
            self.env.wake_lock.acquire(WAKE_LOCK_TAG);
            inner.wake_lock_held = true;
        }
    }

    fn release_wake_lock(&self, inner: &mut SessionInner) {
        if inner.wake_lock_held {
            self.env.wake_lock.release(WAKE_LOCK_TAG);
            inner.wake_lock_held = false;
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn mode(&self) -> ModeKind {
        lock(&self.inner).mode.kind()
    }

    pub fn routes(&self) -> Routes {
        lock(&self.inner).routes
    }

    pub fn devices(&self) -> DeviceMask {
        lock(&self.inner).shape.devices
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.inner).shape.sample_rate
    }

    pub fn channels(&self) -> u32 {
        lock(&self.inner).shape.channels
    }

    pub fn format(&self) -> AudioFormat {
        lock(&self.inner).shape.format
    }

    pub fn session_id(&self) -> i32 {
        lock(&self.inner).shape.session_id
    }

    /// Parameters of the open PCM handle, if any.
    pub fn pcm_params(&self) -> Option<HandleParams> {
        lock(&self.inner).pcm.as_ref().map(|h| h.params().clone())
    }

    /// Parameters of the open tunnel handle, if any.
    pub fn tunnel_params(&self) -> Option<HandleParams> {
        lock(&self.inner).tunnel.as_ref().map(|h| h.params().clone())
    }

    pub fn set_observer(&self, observer: Arc<dyn EosObserver>) {
        self.events.set_observer(observer);
    }

    /// Start the PCM handle (or the tunnel handle when there is none).
    pub fn start(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        let handle = match (inner.pcm.as_mut(), inner.tunnel.as_mut()) {
            (Some(h), _) | (None, Some(h)) => h,
            (None, None) => return Err(SessionError::NoDevice("pcm")),
        };
        handle.start()?;
        inner.state = SessionState::Running;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        for handle in [inner.pcm.as_mut(), inner.tunnel.as_mut()].into_iter().flatten() {
            if let Err(e) = handle.pause(true) {
                tracing::warn!(use_case = handle.params().use_case_name(), "pause failed: {e}");
            }
        }
        self.events.tunnel_paused.store(true, Ordering::Release);
        inner.state = SessionState::Paused;
        tracing::debug!("session paused");
        Ok(())
    }

    /// Resume after pause. A tunnel flushed while paused is drained here
    /// instead of unpaused.
    pub fn resume(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        if let Some(pcm) = inner.pcm.as_mut() {
            if let Err(e) = pcm.pause(false) {
                tracing::warn!("pcm resume failed: {e}");
            }
        }
        if let (SessionMode::Tunnel(path), Some(tunnel)) =
            (&mut inner.mode, inner.tunnel.as_mut())
        {
            if path.seeking {
                if let Err(e) = drain_tunnel(tunnel.as_mut(), &self.events) {
                    tracing::warn!("tunnel drain on resume failed: {e}");
                }
                path.seeking = false;
            } else if let Err(e) = tunnel.pause(false) {
                tracing::warn!("tunnel resume failed: {e}");
            }
        }
        self.events.tunnel_paused.store(false, Ordering::Release);
        inner.state = SessionState::Running;
        tracing::debug!("session resumed");
        Ok(())
    }

    /// Discard everything queued and wake any writer waiting for a buffer.
    pub fn flush(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        let previous = inner.state;
        inner.state = SessionState::Flushing;
        let result = self.flush_locked(inner);
        inner.state = previous;
        result
    }

    fn flush_locked(&self, inner: &mut SessionInner) -> Result<()> {
        if let (SessionMode::Tunnel(path), Some(tunnel)) =
            (&mut inner.mode, inner.tunnel.as_mut())
        {
            let buffers = self.queues.reset_all();
            tracing::debug!(buffers, "tunnel queues reset");
            path.eos_signalled = false;
            self.events.reset_eos();
            if self.events.tunnel_paused.load(Ordering::Acquire) {
                path.seeking = true;
            } else {
                tunnel.pause(true)?;
                drain_tunnel(tunnel.as_mut(), &self.events)?;
            }
            self.queues.request_skip();
        }
        if let SessionMode::DecodeChain(path) = &mut inner.mode {
            path.adapter.reset();
            path.state = DecodeState::Decoding;
        }
        inner.frame_count = 0;
        Ok(())
    }

    /// Release every hardware resource. Calling it again does nothing.
    pub fn stop(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        if guard.state == SessionState::Stopped {
            return Ok(());
        }
        self.teardown(&mut guard);
        tracing::info!("output session stopped");
        Ok(())
    }

    fn teardown(&self, inner: &mut SessionInner) {
        self.queues.request_skip();
        self.queues.close();
        if let Some(mut event) = inner.event.take() {
            event.shutdown();
        }
        self.close_proxy(inner);
        for mut handle in [inner.pcm.take(), inner.tunnel.take()].into_iter().flatten() {
            if let Err(e) = handle.close() {
                tracing::warn!(use_case = handle.params().use_case_name(), "close failed: {e}");
            }
        }
        if let SessionMode::Tunnel(path) = &mut inner.mode {
            if let Some(pool) = path.pool.take() {
                pool.release(&self.queues);
            }
        }
        self.release_wake_lock(inner);
        inner.routes = Routes::default();
        inner.mode = SessionMode::Unconfigured;
        inner.frame_count = 0;
        inner.state = SessionState::Stopped;
    }

    /// Put the output into its low-power state until the next write.
    pub fn standby(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if inner.state == SessionState::Stopped {
            return Ok(());
        }
        for handle in [inner.pcm.as_mut(), inner.tunnel.as_mut()].into_iter().flatten() {
            if let Err(e) = handle.standby() {
                tracing::warn!(use_case = handle.params().use_case_name(), "standby failed: {e}");
            }
        }
        self.release_wake_lock(inner);
        inner.frame_count = 0;
        if let SessionMode::DecodeChain(path) = &mut inner.mode {
            path.adapter.reset();
        }
        Ok(())
    }

    /// Apply `key=value;...` parameters. Only `routing` is acted on.
    pub fn set_parameters(&self, kv: &str) -> Result<()> {
        let params = Params::parse(kv);
        for key in params.keys().filter(|k| *k != KEY_ROUTING) {
            tracing::debug!(key, "ignoring parameter");
        }
        let Some(devices) = params.routing() else {
            return Ok(());
        };
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        if devices.is_empty() {
            tracing::debug!("routing to no device ignored");
            return Ok(());
        }
        self.do_routing(inner, devices)
    }

    /// Answer a `key;key` query with `key=value` pairs for the keys we know.
    pub fn get_parameters(&self, keys: &str) -> String {
        let query = Params::parse(keys);
        let inner = lock(&self.inner);
        let mut reply = Params::default();
        for key in query.keys() {
            if key == KEY_ROUTING {
                reply.insert(KEY_ROUTING, inner.shape.devices.bits());
            }
        }
        reply.to_string()
    }

    /// Move the session to `requested` devices.
    pub fn route(&self, requested: DeviceMask) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        self.do_routing(inner, requested)
    }

    fn do_routing(&self, inner: &mut SessionInner, requested: DeviceMask) -> Result<()> {
        let mut devices = requested;
        let to_a2dp = devices.intersects(DeviceMask::ALL_A2DP);
        inner.routes.capture_from_proxy = to_a2dp;
        inner.routes.a2dp = to_a2dp;
        if to_a2dp {
            devices = devices.without(DeviceMask::ALL_A2DP).union(DeviceMask::PROXY);
        }
        tracing::info!(requested = %requested, effective = %devices, "routing session");
        inner.shape.devices = devices;

        let driver = &self.env.driver;
        if let Some(pcm) = inner.pcm.as_mut() {
            let target = pcm_devices(devices, &inner.routes);
            if pcm.params().devices != target {
                driver.route(pcm.as_mut(), target)?;
            }
        }
        if let Some(tunnel) = inner.tunnel.as_mut() {
            driver.route(tunnel.as_mut(), tunnel_devices(devices, &inner.routes))?;
        } else if matches!(inner.mode, SessionMode::DecodeChain(_)) {
            let spdif = devices.intersects(DeviceMask::SPDIF);
            if inner.routes.compressed_to_spdif != spdif {
                tracing::debug!(spdif, "compressed spdif route changed");
                inner.routes.compressed_to_spdif = spdif;
            }
        }
        if inner.routes.pcm_to_spdif && devices.intersects(DeviceMask::SPDIF) {
            driver.set_spdif_channel_status(inner.shape.sample_rate)?;
        }

        if to_a2dp {
            if matches!(inner.proxy, ProxySlot::Closed) {
                let capture = driver.open_proxy_capture(self.env.config.proxy_period_bytes)?;
                inner.proxy = ProxySlot::Idle(capture);
            }
            if !matches!(inner.proxy, ProxySlot::Bridging(_)) {
                if inner.a2dp_stream.is_none() {
                    inner.a2dp_stream = Some(self.open_a2dp_stream()?);
                }
                self.start_a2dp_bridge(inner)?;
            }
        } else {
            self.close_proxy(inner);
        }
        Ok(())
    }

    /// Map a stereo gain pair onto the hardware stream volume.
    pub fn set_volume(&self, left: f32, right: f32) -> Result<()> {
        let mut avg = (left + right) / 2.0;
        if avg.is_nan() || !(0.0..=1.0).contains(&avg) {
            tracing::warn!(left, right, "volume out of range; clamping");
            avg = if avg.is_nan() { 0.0 } else { avg.clamp(0.0, 1.0) };
        }
        let volume = ((avg * STREAM_VOLUME_MAX as f32).round() as u32).min(STREAM_VOLUME_MAX);

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        ensure_open(inner)?;
        let handle = match (inner.pcm.as_mut(), inner.tunnel.as_mut()) {
            (Some(h), _) | (None, Some(h)) => h,
            (None, None) => {
                return Err(SessionError::InvalidOperation(
                    "no open handle to apply volume".to_string(),
                ));
            }
        };
        handle.set_volume(volume)?;
        inner.stream_volume = volume;
        Ok(())
    }

    /// Output latency in milliseconds, rounded up.
    pub fn latency_ms(&self) -> u32 {
        let inner = lock(&self.inner);
        inner
            .pcm
            .as_ref()
            .or(inner.tunnel.as_ref())
            .map_or(0, |h| h.latency_micros().div_ceil(1000))
    }

    /// Periods written to hardware since open or the last flush/standby.
    pub fn render_position(&self) -> u64 {
        lock(&self.inner).frame_count
    }

    /// Rendered position in microseconds reported by the tunnel handle.
    pub fn timestamp(&self) -> Result<Option<u64>> {
        let inner = lock(&self.inner);
        match inner.tunnel.as_ref() {
            Some(tunnel) => Ok(Some(tunnel.timestamp()?)),
            None => Ok(None),
        }
    }

    pub(crate) fn open_pcm_handle(
        &self,
        shape: &StreamShape,
        routes: &Routes,
    ) -> Result<Box<dyn PcmHandle>> {
        let driver = &self.env.driver;
        let params = HandleParams {
            use_case: crate::hw::UseCase::Pcm,
            slot: crate::hw::UseCaseSlot::for_active_verb(driver.current_verb().as_deref()),
            devices: pcm_devices(shape.devices, routes),
            sample_rate: shape.sample_rate,
            channels: shape.channels,
            format: crate::hw::SampleFormat::S16Le,
            buffer_bytes: self.env.config.pcm_buffer_bytes,
            latency_us: self.env.config.playback_latency_us,
        };
        tracing::debug!(
            use_case = params.use_case_name(),
            devices = %params.devices,
            "opening pcm handle"
        );
        let mut handle = driver.open(&params)?;
        if routes.pcm_to_spdif {
            if let Err(e) = driver.set_spdif_channel_status(shape.sample_rate) {
                let _ = handle.close();
                return Err(e.into());
            }
        }
        Ok(handle)
    }

    pub(crate) fn open_tunnel_handle(
        &self,
        slot: &mut Option<Box<dyn PcmHandle>>,
        path: &mut TunnelPath,
        shape: &StreamShape,
        routes: &Routes,
    ) -> Result<()> {
        let driver = &self.env.driver;
        let cfg = &self.env.config;
        let params = HandleParams {
            use_case: crate::hw::UseCase::Tunnel,
            slot: crate::hw::UseCaseSlot::for_active_verb(driver.current_verb().as_deref()),
            devices: tunnel_devices(shape.devices, routes),
            sample_rate: shape.sample_rate,
            channels: shape.channels,
            format: crate::hw::SampleFormat::Compressed(shape.format),
            buffer_bytes: cfg.tunnel_buffer_bytes,
            latency_us: cfg.playback_latency_us,
        };
        tracing::debug!(
            use_case = params.use_case_name(),
            devices = %params.devices,
            "opening tunnel handle"
        );
        let mut handle = driver.open(&params)?;
        if let Err(e) = handle.prepare() {
            let _ = handle.close();
            return Err(e.into());
        }
        if path.pool.is_none() {
            let allocated = BufferPool::allocate(
                cfg.tunnel_buffer_count,
                cfg.tunnel_buffer_bytes,
                &self.queues,
            );
            match allocated {
                Ok(pool) => path.pool = Some(pool),
                Err(e) => {
                    let _ = handle.close();
                    return Err(e);
                }
            }
        }
        *slot = Some(handle);
        Ok(())
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        let mut guard = lock(&self.inner);
        if guard.state != SessionState::Stopped {
            self.teardown(&mut guard);
        }
    }
}

fn ensure_open(inner: &SessionInner) -> Result<()> {
    if inner.state == SessionState::Stopped {
        return Err(SessionError::Stopped);
    }
    Ok(())
}

/// Devices for the PCM handle: SPDIF only when PCM is routed there.
fn pcm_devices(devices: DeviceMask, routes: &Routes) -> DeviceMask {
    if routes.pcm_to_spdif {
        devices
    } else {
        devices.without(DeviceMask::SPDIF)
    }
}

/// Devices for the tunnel handle: proxy plus SPDIF when bridging.
fn tunnel_devices(devices: DeviceMask, routes: &Routes) -> DeviceMask {
    if routes.capture_from_proxy {
        devices
            .intersection(DeviceMask::SPDIF)
            .union(DeviceMask::PROXY)
    } else {
        devices
    }
}

/// Reset the tunnel stream. A failure is reported to the observer as end of
/// stream so the client does not wait forever.
pub(crate) fn drain_tunnel(
    tunnel: &mut dyn PcmHandle,
    events: &EventShared,
) -> std::result::Result<(), HwError> {
    tunnel.prepare().inspect_err(|e| {
        tracing::warn!("tunnel drain failed: {e}");
        events.post_eos(0);
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decode::tests::ScriptedDecoder;
    use crate::decode::DecodeCapability;
    use crate::error::DecodeError;
    use crate::hw::UseCase;
    use crate::sim::{HwOp, SimDriver};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    pub(crate) const PERIOD: usize = 512;

    pub(crate) fn test_config() -> SessionConfig {
        SessionConfig {
            tunnel_buffer_count: 4,
            tunnel_buffer_bytes: 4800,
            ..SessionConfig::default()
        }
    }

    pub(crate) fn env(driver: &SimDriver) -> SessionEnv {
        SessionEnv::new(Arc::new(driver.clone())).with_config(test_config())
    }

    pub(crate) fn request(format: AudioFormat, channels: u32) -> SessionRequest {
        SessionRequest {
            format,
            channels,
            sample_rate: 48_000,
            devices: DeviceMask::SPEAKER,
            session_id: 7,
        }
    }

    pub(crate) fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Provider handing out scripted decoders for every codec.
    pub(crate) struct ScriptedProvider {
        pub ratio: usize,
        pub formats: Vec<OutputFormat>,
    }

    impl DecoderProvider for ScriptedProvider {
        fn create(
            &self,
            _codec: CodecKind,
        ) -> std::result::Result<Box<dyn DecodeCapability>, DecodeError> {
            Ok(Box::new(ScriptedDecoder::new(self.ratio, self.formats.clone())))
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingObserver {
        pub calls: AtomicUsize,
    }

    impl EosObserver for CountingObserver {
        fn notify_end_of_stream(&self, _code: i32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingWakeLock {
        held: AtomicUsize,
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self, _tag: &str) {
            self.held.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self, _tag: &str) {
            self.held.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct NullA2dp;

    struct NullA2dpStream;

    impl A2dpStream for NullA2dpStream {
        fn buffer_bytes(&self) -> usize {
            3840
        }
        fn write(&mut self, data: &[u8]) -> std::result::Result<usize, HwError> {
            Ok(data.len())
        }
    }

    impl A2dpOutput for NullA2dp {
        fn open_stream(&self) -> std::result::Result<Box<dyn A2dpStream>, HwError> {
            Ok(Box::new(NullA2dpStream))
        }
    }

    #[test]
    fn open_rejects_missing_device_and_bad_channel_counts() {
        let driver = SimDriver::new(PERIOD);
        let mut req = request(AudioFormat::Pcm16, 2);
        req.devices = DeviceMask::NONE;
        assert!(matches!(
            OutputSession::open(env(&driver), req),
            Err(SessionError::InvalidConfig(_))
        ));
        for channels in [0, 7] {
            assert!(matches!(
                OutputSession::open(env(&driver), request(AudioFormat::Pcm16, channels)),
                Err(SessionError::InvalidConfig(_))
            ));
        }
        assert!(driver.ops().is_empty());
    }

    #[test]
    fn stereo_pcm_opens_direct_with_forced_spdif() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 2)).unwrap();
        assert_eq!(session.mode(), ModeKind::DirectPcm);
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(session.devices(), DeviceMask::SPEAKER.union(DeviceMask::SPDIF));
        let routes = session.routes();
        assert!(routes.pcm && routes.pcm_to_spdif);

        let params = session.pcm_params().unwrap();
        assert_eq!(params.devices, DeviceMask::SPEAKER.union(DeviceMask::SPDIF));
        assert_eq!(params.use_case_name(), "HiFi2");
        assert_eq!(driver.count(|op| matches!(op, HwOp::SpdifStatus(48_000))), 1);
    }

    #[test]
    fn pcm_handle_joins_active_verb_as_modifier() {
        let driver = SimDriver::new(PERIOD);
        driver.set_active_verb(Some("HiFi"));
        let session = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 2)).unwrap();
        assert_eq!(session.pcm_params().unwrap().use_case_name(), "Play Music2");
    }

    #[test]
    fn multichannel_pcm_uses_decode_chain() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 6)).unwrap();
        assert_eq!(session.mode(), ModeKind::DecodeChain);
        let routes = session.routes();
        assert!(routes.compressed_to_spdif);
        assert!(!routes.pcm_to_spdif);
        assert_eq!(session.pcm_params().unwrap().devices, DeviceMask::SPEAKER);
    }

    #[test]
    fn dolby_digital_forces_48k_stereo() {
        let driver = SimDriver::new(PERIOD);
        let stereo = OutputFormat {
            sample_rate: 48_000,
            channels: 2,
        };
        let env = env(&driver).with_decoders(Arc::new(ScriptedProvider {
            ratio: 1,
            formats: vec![stereo],
        }));
        let mut req = request(AudioFormat::Ac3, 6);
        req.sample_rate = 44_100;
        let session = OutputSession::open(env, req).unwrap();
        assert_eq!((session.sample_rate(), session.channels()), (48_000, 2));
    }

    #[test]
    fn missing_decoder_fails_open_without_touching_hardware() {
        let driver = SimDriver::new(PERIOD);
        let result = OutputSession::open(env(&driver), request(AudioFormat::Ac3, 2));
        assert!(matches!(result, Err(SessionError::Decode(DecodeError::Unavailable(_)))));
        assert!(driver.ops().is_empty());
    }

    #[test]
    fn sample_rate_is_capped() {
        let driver = SimDriver::new(PERIOD);
        let mut req = request(AudioFormat::Pcm16, 2);
        req.sample_rate = 96_000;
        let session = OutputSession::open(env(&driver), req).unwrap();
        assert_eq!(session.sample_rate(), 48_000);
    }

    #[test]
    fn a2dp_request_renders_to_proxy() {
        let driver = SimDriver::new(PERIOD);
        let mut req = request(AudioFormat::Pcm16, 2);
        req.devices = DeviceMask::A2DP;
        let session =
            OutputSession::open(env(&driver).with_a2dp(Arc::new(NullA2dp)), req).unwrap();
        let routes = session.routes();
        assert!(routes.capture_from_proxy && routes.a2dp);
        assert_eq!(session.devices(), DeviceMask::PROXY.union(DeviceMask::SPDIF));
        assert_eq!(driver.count(|op| *op == HwOp::ProxyOpen), 1);

        session.stop().unwrap();
        assert_eq!(driver.count(|op| *op == HwOp::ProxyClose), 1);
    }

    #[test]
    fn a2dp_without_output_fails_and_releases_proxy() {
        let driver = SimDriver::new(PERIOD);
        let mut req = request(AudioFormat::Pcm16, 2);
        req.devices = DeviceMask::A2DP;
        let result = OutputSession::open(env(&driver), req);
        assert!(matches!(result, Err(SessionError::NoDevice("a2dp"))));
        assert_eq!(driver.count(|op| *op == HwOp::ProxyClose), 1);
        assert_eq!(driver.count(|op| *op == HwOp::Close(UseCase::Pcm)), 1);
    }

    #[test]
    fn tunnel_open_failure_stops_event_thread() {
        let driver = SimDriver::new(PERIOD);
        driver.fail_next_open(UseCase::Tunnel);
        let result = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2));
        assert!(matches!(result, Err(SessionError::Hardware(HwError::Failed(_)))));
    }

    #[test]
    fn tunnel_open_starts_event_thread_and_pool() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        assert_eq!(session.mode(), ModeKind::Tunnel);
        assert!(session.events.is_alive());
        assert_eq!(session.queues.len_empty(), 4);
        assert_eq!(driver.count(|op| *op == HwOp::Prepare(UseCase::Tunnel)), 1);
        assert!(session.pcm_params().is_none());

        session.stop().unwrap();
        assert!(!session.events.is_alive());
        assert_eq!(session.queues.census().total(), 0);
    }

    #[test]
    fn wma_defers_tunnel_open_until_config() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Wma, 2)).unwrap();
        assert!(session.tunnel_params().is_none());
        assert_eq!(driver.count(|op| matches!(op, HwOp::Open { .. })), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        session.stop().unwrap();
        let ops_after_first = driver.ops().len();
        session.stop().unwrap();
        assert_eq!(driver.ops().len(), ops_after_first);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.mode(), ModeKind::Unconfigured);
        assert_eq!(session.routes(), Routes::default());
        assert!(matches!(session.write(&[0; 4]), Err(SessionError::Stopped)));
        assert!(matches!(session.flush(), Err(SessionError::Stopped)));
    }

    #[test]
    fn pause_and_resume_toggle_tunnel_flag() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        session.pause().unwrap();
        assert!(session.events.tunnel_paused.load(Ordering::SeqCst));
        assert_eq!(session.state(), SessionState::Paused);
        session.resume().unwrap();
        assert!(!session.events.tunnel_paused.load(Ordering::SeqCst));
        assert_eq!(
            driver.count(|op| *op == HwOp::Pause { use_case: UseCase::Tunnel, paused: false }),
            1
        );
    }

    #[test]
    fn flush_while_paused_defers_drain_to_resume() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        session.write(&[1; 4800]).unwrap();
        session.pause().unwrap();
        driver.clear_ops();

        session.flush().unwrap();
        assert_eq!(session.queues.len_filled(), 0);
        assert_eq!(session.queues.len_empty(), 4);
        assert_eq!(driver.count(|op| *op == HwOp::Prepare(UseCase::Tunnel)), 0);
        assert_eq!(session.state(), SessionState::Paused);

        session.resume().unwrap();
        assert_eq!(driver.count(|op| *op == HwOp::Prepare(UseCase::Tunnel)), 1);
        assert_eq!(
            driver.count(|op| *op == HwOp::Pause { use_case: UseCase::Tunnel, paused: false }),
            0
        );
        // Seeking is cleared: a second resume unpauses normally.
        session.resume().unwrap();
        assert_eq!(
            driver.count(|op| *op == HwOp::Pause { use_case: UseCase::Tunnel, paused: false }),
            1
        );
    }

    #[test]
    fn flush_while_running_pauses_then_drains() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        session.write(&[1; 4800]).unwrap();
        session.write(&[1; 4800]).unwrap();
        driver.clear_ops();

        session.flush().unwrap();
        assert_eq!(
            driver.ops(),
            vec![
                HwOp::Pause { use_case: UseCase::Tunnel, paused: true },
                HwOp::Prepare(UseCase::Tunnel),
            ]
        );
        assert_eq!(session.queues.census().empty, vec![0, 1, 2, 3]);
        assert_eq!(session.render_position(), 0);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn failed_drain_reports_end_of_stream() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        let observer = Arc::new(CountingObserver::default());
        session.set_observer(observer.clone());
        driver.fail_next_prepare(UseCase::Tunnel);
        assert!(session.flush().is_err());
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn routing_parameter_moves_handles() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 2)).unwrap();
        let headphone_spdif = DeviceMask::WIRED_HEADPHONE.union(DeviceMask::SPDIF);
        session
            .set_parameters(&format!("routing={};foo=1", headphone_spdif.bits()))
            .unwrap();
        assert_eq!(session.devices(), headphone_spdif);
        assert_eq!(session.pcm_params().unwrap().devices, headphone_spdif);
        assert_eq!(
            driver.count(|op| matches!(op, HwOp::Route { use_case: UseCase::Pcm, .. })),
            1
        );
        assert_eq!(
            session.get_parameters("routing;unknown"),
            format!("routing={}", headphone_spdif.bits())
        );
    }

    #[test]
    fn routing_to_a2dp_starts_bridge_and_back_stops_it() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(
            env(&driver).with_a2dp(Arc::new(NullA2dp)),
            request(AudioFormat::Pcm16, 2),
        )
        .unwrap();
        session.route(DeviceMask::A2DP).unwrap();
        assert!(session.routes().a2dp);
        assert!(matches!(lock(&session.inner).proxy, ProxySlot::Bridging(_)));

        session.route(DeviceMask::SPEAKER).unwrap();
        assert!(!session.routes().a2dp);
        assert!(matches!(lock(&session.inner).proxy, ProxySlot::Closed));
        assert_eq!(driver.count(|op| *op == HwOp::ProxyClose), 1);
    }

    #[test]
    fn volume_maps_average_gain() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 2)).unwrap();
        session.set_volume(0.25, 0.75).unwrap();
        session.set_volume(3.0, 3.0).unwrap();
        let volumes: Vec<u32> = driver
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                HwOp::Volume { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(volumes, vec![0x1000, 0x2000]);
    }

    #[test]
    fn latency_rounds_up_to_milliseconds() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 2)).unwrap();
        assert_eq!(session.latency_ms(), 43);
    }

    #[test]
    fn timestamp_comes_from_tunnel_handle_only() {
        let driver = SimDriver::new(PERIOD);
        let tunnel = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        tunnel.write(&[0; 4800]).unwrap();
        assert_eq!(tunnel.timestamp().unwrap(), Some(25_000));

        let pcm = OutputSession::open(env(&driver), request(AudioFormat::Pcm16, 2)).unwrap();
        assert_eq!(pcm.timestamp().unwrap(), None);
    }

    #[test]
    fn standby_releases_wake_lock_and_resets_position() {
        let driver = SimDriver::new(PERIOD);
        let wake = Arc::new(CountingWakeLock::default());
        let session = OutputSession::open(
            env(&driver).with_wake_lock(wake.clone()),
            request(AudioFormat::Pcm16, 2),
        )
        .unwrap();
        session.write(&[0; 1024]).unwrap();
        assert_eq!(wake.held.load(Ordering::SeqCst), 1);
        assert_eq!(session.render_position(), 2);

        session.standby().unwrap();
        assert_eq!(wake.held.load(Ordering::SeqCst), 0);
        assert_eq!(session.render_position(), 0);
        assert_eq!(driver.count(|op| *op == HwOp::Standby(UseCase::Pcm)), 1);
    }

    #[test]
    fn drop_tears_down_open_session() {
        let driver = SimDriver::new(PERIOD);
        let session = OutputSession::open(env(&driver), request(AudioFormat::Mp3, 2)).unwrap();
        let events = session.events.clone();
        drop(session);
        assert!(!events.is_alive());
        assert_eq!(driver.count(|op| *op == HwOp::Close(UseCase::Tunnel)), 1);
    }
}
