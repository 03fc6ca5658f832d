//! Hardware driver seam.
//!
//! The session never touches registers or ioctls directly. Everything it needs
//! from the PCM layer goes through [`HardwareDriver`] (use-case level calls) and
//! [`PcmHandle`] (one open endpoint).

use crossbeam_channel::Receiver;

use crate::error::HwError;
use crate::format::{AudioFormat, DeviceMask};

/// Verb reported by the use-case manager when nothing is playing.
pub const VERB_INACTIVE: &str = "Inactive";

/// Playback use cases a session can open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UseCase {
    /// Linear PCM rendered by the host (direct PCM or decoder output).
    Pcm,
    /// Compressed bitstream decoded by the DSP.
    Tunnel,
}

impl UseCase {
    /// Name used when the use case becomes the active verb.
    pub fn verb(self) -> &'static str {
        match self {
            UseCase::Pcm => "HiFi2",
            UseCase::Tunnel => "HiFi Tunnel",
        }
    }

    /// Name used when the use case is stacked on an already active verb.
    pub fn modifier(self) -> &'static str {
        match self {
            UseCase::Pcm => "Play Music2",
            UseCase::Tunnel => "Play Tunnel",
        }
    }
}

/// Whether a handle is opened as the active verb or as a modifier on top of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseCaseSlot {
    Verb,
    Modifier,
}

impl UseCaseSlot {
    /// Pick the slot from the verb currently reported by the driver.
    pub fn for_active_verb(active: Option<&str>) -> Self {
        match active {
            None => UseCaseSlot::Verb,
            Some(v) if v == VERB_INACTIVE => UseCaseSlot::Verb,
            Some(_) => UseCaseSlot::Modifier,
        }
    }
}

/// Sample format a handle is opened with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    Compressed(AudioFormat),
}

/// Parameters for opening a PCM endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleParams {
    pub use_case: UseCase,
    pub slot: UseCaseSlot,
    pub devices: DeviceMask,
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
    pub buffer_bytes: usize,
    pub latency_us: u32,
}

impl HandleParams {
    /// Use-case name as registered with the use-case manager.
    pub fn use_case_name(&self) -> &'static str {
        match self.slot {
            UseCaseSlot::Verb => self.use_case.verb(),
            UseCaseSlot::Modifier => self.use_case.modifier(),
        }
    }
}

/// One hardware period consumed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodTick;

/// An open hardware endpoint.
pub trait PcmHandle: Send {
    /// Parameters the handle was opened (or last routed) with.
    fn params(&self) -> &HandleParams;

    /// Negotiated period size in bytes; the minimum transfer granularity.
    fn period_bytes(&self) -> usize;

    /// Send bytes to the device. Returns the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, HwError>;

    fn start(&mut self) -> Result<(), HwError>;

    fn is_started(&self) -> bool;

    fn pause(&mut self, paused: bool) -> Result<(), HwError>;

    /// Reset the stream (drop queued data, rewind pointers) ready for new data.
    fn prepare(&mut self) -> Result<(), HwError>;

    /// Low-power transition; the next write wakes the device again.
    fn standby(&mut self) -> Result<(), HwError>;

    /// Recover a handle stuck in [`HwError::BadState`] by reopening the endpoint.
    fn reopen(&mut self) -> Result<(), HwError>;

    fn close(&mut self) -> Result<(), HwError>;

    fn latency_micros(&self) -> u32;

    /// Timer that fires once per consumed period, if the endpoint provides one.
    fn period_timer(&self) -> Option<Receiver<PeriodTick>>;

    /// Record a routing change applied by the driver.
    fn set_devices(&mut self, devices: DeviceMask);

    fn set_volume(&mut self, volume: u32) -> Result<(), HwError>;

    /// Push codec configuration (e.g. WMA parameters) to a compressed endpoint.
    fn set_codec_params(&mut self, _config: &[u8]) -> Result<(), HwError> {
        Err(HwError::Unsupported("codec parameters".to_string()))
    }

    /// Rendered position of a compressed endpoint in microseconds.
    fn timestamp(&self) -> Result<u64, HwError> {
        Err(HwError::Unsupported("timestamp".to_string()))
    }
}

/// Capture side of the proxy port used to bridge rendered audio elsewhere.
pub trait CaptureHandle: Send {
    fn period_bytes(&self) -> usize;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, HwError>;

    fn close(&mut self);
}

/// Use-case level driver entry points.
pub trait HardwareDriver: Send + Sync {
    fn open(&self, params: &HandleParams) -> Result<Box<dyn PcmHandle>, HwError>;

    /// Verb currently active in the use-case manager.
    fn current_verb(&self) -> Option<String>;

    /// Move an open handle to a new device mask.
    fn route(&self, handle: &mut dyn PcmHandle, devices: DeviceMask) -> Result<(), HwError>;

    /// Program SPDIF channel status for linear PCM at `sample_rate`.
    fn set_spdif_channel_status(&self, sample_rate: u32) -> Result<(), HwError>;

    fn open_proxy_capture(&self, _period_bytes: usize) -> Result<Box<dyn CaptureHandle>, HwError> {
        Err(HwError::Unsupported("proxy capture".to_string()))
    }
}

/// Write one chunk, recovering once from [`HwError::BadState`] by reopening.
///
/// Any other error, a failed reopen, or a second bad-state result is returned.
pub(crate) fn write_with_recovery(
    handle: &mut dyn PcmHandle,
    data: &[u8],
) -> Result<usize, HwError> {
    match handle.write(data) {
        Err(HwError::BadState) => {
            tracing::warn!(
                use_case = handle.params().use_case_name(),
                "device in bad state; reopening"
            );
            handle.reopen()?;
            handle.write(data)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_follows_active_verb() {
        assert_eq!(UseCaseSlot::for_active_verb(None), UseCaseSlot::Verb);
        assert_eq!(
            UseCaseSlot::for_active_verb(Some(VERB_INACTIVE)),
            UseCaseSlot::Verb
        );
        assert_eq!(
            UseCaseSlot::for_active_verb(Some("HiFi")),
            UseCaseSlot::Modifier
        );
    }

    #[test]
    fn use_case_name_depends_on_slot() {
        let mut params = HandleParams {
            use_case: UseCase::Tunnel,
            slot: UseCaseSlot::Verb,
            devices: DeviceMask::SPEAKER,
            sample_rate: 48_000,
            channels: 2,
            format: SampleFormat::Compressed(AudioFormat::Mp3),
            buffer_bytes: 4800,
            latency_us: 0,
        };
        assert_eq!(params.use_case_name(), "HiFi Tunnel");
        params.slot = UseCaseSlot::Modifier;
        assert_eq!(params.use_case_name(), "Play Tunnel");
    }
}
