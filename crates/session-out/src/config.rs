//! Runtime configuration for the `session-out` binary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use audio_session::{AudioFormat, DeviceMask, SessionConfig};
use serde::Deserialize;

use crate::cli::Sink;

/// Contents of the optional `--config` TOML file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Output device used when `--device` is not given.
    pub device: Option<String>,
    pub session: SessionConfig,
}

impl FileConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub path: PathBuf,
    pub device: Option<String>,
    pub format: AudioFormat,
    pub channels: u32,
    pub sample_rate: u32,
    pub devices: DeviceMask,
    pub sink: Sink,
    pub chunk_bytes: usize,
    pub volume: Option<f32>,
    pub status_json: bool,
    pub session: SessionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_session_defaults() {
        let cfg: FileConfig = toml::from_str(
            r#"
            device = "USB DAC"

            [session]
            tunnel_buffer_count = 64
            force_spdif = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device.as_deref(), Some("USB DAC"));
        assert_eq!(cfg.session.tunnel_buffer_count, 64);
        assert!(!cfg.session.force_spdif);
        assert_eq!(cfg.session.tunnel_buffer_bytes, 4800);
    }

    #[test]
    fn missing_path_gives_defaults() {
        let cfg = FileConfig::load(None).unwrap();
        assert!(cfg.device.is_none());
        assert_eq!(cfg.session.max_sample_rate, 48_000);
    }
}
