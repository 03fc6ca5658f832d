//! Stream formats, codec identities and output device masks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Requested stream format, as handed over by the audio framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioFormat {
    Pcm16,
    Aac,
    HeAacV1,
    HeAacV2,
    AacAdif,
    Ac3,
    Ac3Plus,
    Wma,
    Dts,
    Mp3,
}

impl AudioFormat {
    /// AAC variants decoded in software, first buffer carries codec config.
    pub fn is_aac_family(self) -> bool {
        matches!(
            self,
            AudioFormat::Aac | AudioFormat::HeAacV1 | AudioFormat::HeAacV2 | AudioFormat::AacAdif
        )
    }

    pub fn is_dolby_digital(self) -> bool {
        matches!(self, AudioFormat::Ac3 | AudioFormat::Ac3Plus)
    }

    /// Formats the DSP decodes itself (tunnel mode).
    pub fn is_tunnel_decoded(self) -> bool {
        matches!(self, AudioFormat::Wma | AudioFormat::Dts | AudioFormat::Mp3)
    }

    /// Codec identity used when this format runs through the software decode chain.
    pub fn decode_codec(self) -> Option<CodecKind> {
        if self.is_aac_family() {
            Some(CodecKind::Aac)
        } else if self.is_dolby_digital() {
            Some(CodecKind::DolbyDigitalPlus)
        } else {
            None
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::Pcm16 => "pcm16",
            AudioFormat::Aac => "aac",
            AudioFormat::HeAacV1 => "he-aac-v1",
            AudioFormat::HeAacV2 => "he-aac-v2",
            AudioFormat::AacAdif => "aac-adif",
            AudioFormat::Ac3 => "ac3",
            AudioFormat::Ac3Plus => "ac3-plus",
            AudioFormat::Wma => "wma",
            AudioFormat::Dts => "dts",
            AudioFormat::Mp3 => "mp3",
        };
        f.write_str(name)
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = match s.trim().to_ascii_lowercase().as_str() {
            "pcm" | "pcm16" => AudioFormat::Pcm16,
            "aac" => AudioFormat::Aac,
            "he-aac-v1" => AudioFormat::HeAacV1,
            "he-aac-v2" => AudioFormat::HeAacV2,
            "aac-adif" | "adif" => AudioFormat::AacAdif,
            "ac3" => AudioFormat::Ac3,
            "ac3-plus" | "eac3" => AudioFormat::Ac3Plus,
            "wma" => AudioFormat::Wma,
            "dts" => AudioFormat::Dts,
            "mp3" => AudioFormat::Mp3,
            other => return Err(format!("unknown format: {other}")),
        };
        Ok(format)
    }
}

/// Codec identity passed to a decode capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// AAC family (LC, HE v1/v2, ADIF).
    Aac,
    /// AC3 / E-AC3.
    DolbyDigitalPlus,
    /// Multichannel linear PCM re-rendered to stereo.
    ExternalPcm,
}

/// Output device bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceMask(pub u32);

impl DeviceMask {
    pub const NONE: DeviceMask = DeviceMask(0);
    pub const EARPIECE: DeviceMask = DeviceMask(0x1);
    pub const SPEAKER: DeviceMask = DeviceMask(0x2);
    pub const WIRED_HEADSET: DeviceMask = DeviceMask(0x4);
    pub const WIRED_HEADPHONE: DeviceMask = DeviceMask(0x8);
    pub const A2DP: DeviceMask = DeviceMask(0x80);
    pub const A2DP_HEADPHONES: DeviceMask = DeviceMask(0x100);
    pub const A2DP_SPEAKER: DeviceMask = DeviceMask(0x200);
    pub const ALL_A2DP: DeviceMask = DeviceMask(0x380);
    pub const AUX_DIGITAL: DeviceMask = DeviceMask(0x400);
    pub const SPDIF: DeviceMask = DeviceMask(0x2000);
    pub const PROXY: DeviceMask = DeviceMask(0x8000);
    pub const ALL: DeviceMask = DeviceMask(0xffff);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if any bit of `other` is set.
    pub fn intersects(self, other: DeviceMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 | other.0)
    }

    pub fn without(self, other: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 & !other.0)
    }

    pub fn intersection(self, other: DeviceMask) -> DeviceMask {
        DeviceMask(self.0 & other.0)
    }

    /// Parse a comma separated list of device names or a numeric mask.
    pub fn parse_list(s: &str) -> Result<DeviceMask, String> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x") {
            return u32::from_str_radix(hex, 16)
                .map(DeviceMask)
                .map_err(|e| format!("bad device mask {s}: {e}"));
        }
        if let Ok(bits) = s.parse::<u32>() {
            return Ok(DeviceMask(bits));
        }
        let mut mask = DeviceMask::NONE;
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let bit = match name.to_ascii_lowercase().as_str() {
                "earpiece" => DeviceMask::EARPIECE,
                "speaker" => DeviceMask::SPEAKER,
                "headset" => DeviceMask::WIRED_HEADSET,
                "headphone" => DeviceMask::WIRED_HEADPHONE,
                "a2dp" => DeviceMask::A2DP,
                "hdmi" | "aux-digital" => DeviceMask::AUX_DIGITAL,
                "spdif" => DeviceMask::SPDIF,
                "proxy" => DeviceMask::PROXY,
                other => return Err(format!("unknown device: {other}")),
            };
            mask = mask.union(bit);
        }
        Ok(mask)
    }
}

impl fmt::Display for DeviceMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
