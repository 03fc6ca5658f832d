use serde::Deserialize;

/// Minimum input per channel before an ADIF AAC decode call is worthwhile.
pub const AAC_BLOCK_PER_CHANNEL: usize = 768;
/// Minimum input per channel before an external PCM render call is worthwhile.
pub const PCM_BLOCK_PER_CHANNEL: usize = 1536;
/// Full-scale value of the hardware stream volume.
pub const STREAM_VOLUME_MAX: u32 = 0x2000;

/// Session tuning parameters shared by the pool, dispatcher and bridge stages.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of buffers in the tunnel buffer pool.
    pub tunnel_buffer_count: usize,
    /// Capacity of each tunnel pool buffer in bytes.
    pub tunnel_buffer_bytes: usize,
    /// Buffer size requested when opening a PCM handle.
    pub pcm_buffer_bytes: usize,
    /// Highest sample rate the PCM path is opened with.
    pub max_sample_rate: u32,
    /// Highest channel count accepted for linear PCM.
    pub max_pcm_channels: u32,
    /// Always add the SPDIF output to the requested device mask.
    pub force_spdif: bool,
    /// Latency requested from the driver when opening handles.
    pub playback_latency_us: u32,
    /// Period size of the proxy capture port used for A2DP bridging, in bytes.
    pub proxy_period_bytes: usize,
}

impl Default for SessionConfig {
    /// Defaults match the broadcast tunnel playback setup.
    fn default() -> Self {
        Self {
            tunnel_buffer_count: 512,
            tunnel_buffer_bytes: 4800,
            pcm_buffer_bytes: 4096,
            max_sample_rate: 48_000,
            max_pcm_channels: 6,
            force_spdif: true,
            playback_latency_us: 96_000,
            proxy_period_bytes: 1920,
        }
    }
}
