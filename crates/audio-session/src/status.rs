use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::decode::OutputFormat;
use crate::format::{AudioFormat, DeviceMask};
use crate::queues::lock;
use crate::session::{
    DecodeState, ModeKind, OutputSession, ProxySlot, Routes, SessionMode, SessionState,
};

/// Point-in-time view of a session, for logs and host status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub session_id: i32,
    pub state: SessionState,
    pub mode: ModeKind,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u32,
    pub devices: DeviceMask,
    pub routes: Routes,
    /// Periods written since open or the last flush/standby.
    pub frames_written: u64,
    pub stream_volume: u32,
    pub wake_lock_held: bool,
    pub a2dp_bridge_running: bool,
    pub tunnel: Option<TunnelStatus>,
    pub decode: Option<DecodeStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TunnelStatus {
    pub pool_buffers: usize,
    pub empty_buffers: usize,
    pub filled_buffers: usize,
    pub buffers_retired: u64,
    pub paused: bool,
    pub seeking: bool,
    pub eos_signalled: bool,
    pub reached_eos: bool,
    pub eos_posted: bool,
    pub event_thread_alive: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodeStatus {
    pub state: DecodeState,
    pub output: OutputFormat,
    pub buffered_input: usize,
    pub buffered_output: usize,
    /// Decode calls that consumed input without producing output.
    pub empty_decodes: u64,
}

impl OutputSession {
    /// Snapshot the session for status reporting.
    pub fn status(&self) -> SessionStatus {
        let inner = lock(&self.inner);
        let events = &self.events;
        let tunnel = match &inner.mode {
            SessionMode::Tunnel(path) => Some(TunnelStatus {
                pool_buffers: path.pool.map_or(0, |p| p.count()),
                empty_buffers: self.queues.len_empty(),
                filled_buffers: self.queues.len_filled(),
                buffers_retired: events.reclaimed(),
                paused: events.tunnel_paused.load(Ordering::Acquire),
                seeking: path.seeking,
                eos_signalled: path.eos_signalled,
                reached_eos: events.reached_eos.load(Ordering::Acquire),
                eos_posted: events.eos_posted(),
                event_thread_alive: events.is_alive(),
            }),
            _ => None,
        };
        let decode = match &inner.mode {
            SessionMode::DecodeChain(path) => Some(DecodeStatus {
                state: path.state,
                output: path.adapter.output_format(),
                buffered_input: path.adapter.buffered_input(),
                buffered_output: path.adapter.buffered_output(),
                empty_decodes: path.empty_decodes,
            }),
            _ => None,
        };
        SessionStatus {
            session_id: inner.shape.session_id,
            state: inner.state,
            mode: inner.mode.kind(),
            format: inner.shape.format,
            sample_rate: inner.shape.sample_rate,
            channels: inner.shape.channels,
            devices: inner.shape.devices,
            routes: inner.routes,
            frames_written: inner.frame_count,
            stream_volume: inner.stream_volume,
            wake_lock_held: inner.wake_lock_held,
            a2dp_bridge_running: matches!(inner.proxy, ProxySlot::Bridging(_)),
            tunnel,
            decode,
        }
    }
}
