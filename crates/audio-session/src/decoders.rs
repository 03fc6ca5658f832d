//! Built-in decode capabilities.
//!
//! - [`Downmixer`]: multichannel 16-bit PCM to stereo (the external PCM renderer)
//! - [`SymphoniaAacDecoder`]: raw AAC access units via Symphonia
//!
//! Dolby Digital has no software decoder here; sessions asking for it fail at open.

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;

use crate::decode::{DecodeCapability, DecoderProvider, OutputFormat};
use crate::error::DecodeError;
use crate::format::CodecKind;

/// Gain applied to centre and surround channels when folding them into L/R.
const FOLD_GAIN: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Default provider backed by the decoders in this module.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinDecoders;

impl DecoderProvider for BuiltinDecoders {
    fn create(&self, codec: CodecKind) -> Result<Box<dyn DecodeCapability>, DecodeError> {
        match codec {
            CodecKind::Aac => Ok(Box::new(SymphoniaAacDecoder::default())),
            CodecKind::ExternalPcm => Ok(Box::new(Downmixer::default())),
            CodecKind::DolbyDigitalPlus => {
                Err(DecodeError::Unavailable("Dolby Digital".to_string()))
            }
        }
    }
}

/// Positions of the channels that feed the stereo fold-down.
struct Layout {
    centre: Option<usize>,
    rear_left: Option<usize>,
    rear_right: Option<usize>,
}

/// WAV channel order: L R C LFE Ls Rs, with C/LFE absent in quad.
fn layout_for(channels: usize) -> Layout {
    match channels {
        3 => Layout {
            centre: Some(2),
            rear_left: None,
            rear_right: None,
        },
        4 => Layout {
            centre: None,
            rear_left: Some(2),
            rear_right: Some(3),
        },
        5 => Layout {
            centre: Some(2),
            rear_left: Some(3),
            rear_right: Some(4),
        },
        _ => Layout {
            centre: Some(2),
            rear_left: Some(4),
            rear_right: Some(5),
        },
    }
}

/// Fold interleaved `channels`-wide frames into stereo. LFE is dropped.
fn downmix_to_stereo(samples: &[i16], channels: usize, out: &mut Vec<u8>) {
    if channels == 0 {
        return;
    }
    if channels <= 2 {
        for frame in samples.chunks_exact(channels) {
            let l = frame[0];
            let r = if channels == 2 { frame[1] } else { l };
            out.extend_from_slice(&l.to_le_bytes());
            out.extend_from_slice(&r.to_le_bytes());
        }
        return;
    }

    let layout = layout_for(channels);
    let centre_gain = if layout.centre.is_some() { FOLD_GAIN } else { 0.0 };
    let rear_gain = if layout.rear_left.is_some() { FOLD_GAIN } else { 0.0 };
    let norm = 1.0 / (1.0 + centre_gain + rear_gain);
    let at = |frame: &[i16], idx: Option<usize>| idx.map_or(0.0, |i| f32::from(frame[i]));

    for frame in samples.chunks_exact(channels) {
        let c = at(frame, layout.centre) * centre_gain;
        let l = f32::from(frame[0]) + c + at(frame, layout.rear_left) * rear_gain;
        let r = f32::from(frame[1]) + c + at(frame, layout.rear_right) * rear_gain;
        for v in [l, r] {
            let s = (v * norm).round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
}

/// Multichannel linear PCM renderer producing stereo at the input rate.
#[derive(Debug, Default)]
pub struct Downmixer {
    channels: usize,
    sample_rate: u32,
    pending: Vec<u8>,
}

impl DecodeCapability for Downmixer {
    fn configure(
        &mut self,
        _codec: CodecKind,
        channels: u32,
        sample_rate: u32,
    ) -> Result<(), DecodeError> {
        if channels == 0 {
            return Err(DecodeError::Config("zero channels".to_string()));
        }
        self.channels = channels as usize;
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn submit_input(&mut self, input: &[u8]) -> usize {
        let frame_bytes = self.channels * 2;
        if frame_bytes == 0 {
            return 0;
        }
        let usable = input.len() / frame_bytes * frame_bytes;
        let samples: Vec<i16> = input[..usable]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        downmix_to_stereo(&samples, self.channels, &mut self.pending);
        usable
    }

    fn produce_output(&mut self, out: &mut Vec<u8>) -> OutputFormat {
        out.append(&mut self.pending);
        OutputFormat {
            sample_rate: self.sample_rate,
            channels: 2,
        }
    }
}

/// AAC decoder fed one raw access unit per submission.
///
/// The decoder is built lazily so the AudioSpecificConfig delivered as the
/// first stream buffer can be passed as extra data.
#[derive(Default)]
pub struct SymphoniaAacDecoder {
    sample_rate: u32,
    channels: u32,
    extra_data: Option<Box<[u8]>>,
    decoder: Option<Box<dyn Decoder>>,
    pending: Vec<u8>,
    format: Option<OutputFormat>,
    ts: u64,
}

impl SymphoniaAacDecoder {
    fn build_decoder(&self) -> Result<Box<dyn Decoder>, DecodeError> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_AAC);
        if self.sample_rate > 0 {
            params.with_sample_rate(self.sample_rate);
        }
        if (1..=8).contains(&self.channels) {
            params.with_channels(Channels::from_bits_truncate((1u32 << self.channels) - 1));
        }
        if let Some(extra) = &self.extra_data {
            params.with_extra_data(extra.clone());
        }
        symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Config(e.to_string()))
    }
}

impl DecodeCapability for SymphoniaAacDecoder {
    fn configure(
        &mut self,
        _codec: CodecKind,
        channels: u32,
        sample_rate: u32,
    ) -> Result<(), DecodeError> {
        self.channels = channels;
        self.sample_rate = sample_rate;
        self.decoder = None;
        Ok(())
    }

    fn set_codec_config(&mut self, config: &[u8]) -> Result<(), DecodeError> {
        self.extra_data = Some(config.into());
        self.decoder = Some(self.build_decoder()?);
        Ok(())
    }

    fn submit_input(&mut self, input: &[u8]) -> usize {
        if self.decoder.is_none() {
            match self.build_decoder() {
                Ok(d) => self.decoder = Some(d),
                Err(e) => {
                    tracing::warn!("aac decoder unavailable, dropping input: {e}");
                    return input.len();
                }
            }
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return input.len();
        };

        let packet = Packet::new_from_slice(0, self.ts, 1024, input);
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let frames = decoded.frames();
                let mut sample_buf = SampleBuffer::<i16>::new(frames as u64, spec);
                sample_buf.copy_interleaved_ref(decoded);
                let channels = spec.channels.count();
                downmix_to_stereo(sample_buf.samples(), channels, &mut self.pending);
                self.ts += frames as u64;
                self.format = Some(OutputFormat {
                    sample_rate: spec.rate,
                    channels: 2,
                });
            }
            Err(e) => tracing::debug!("aac access unit dropped: {e}"),
        }
        input.len()
    }

    fn produce_output(&mut self, out: &mut Vec<u8>) -> OutputFormat {
        out.append(&mut self.pending);
        self.format.unwrap_or(OutputFormat {
            sample_rate: self.sample_rate,
            channels: self.channels.min(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn downmixer_folds_six_channels_to_stereo() {
        let mut d = Downmixer::default();
        d.configure(CodecKind::ExternalPcm, 6, 44_100).unwrap();
        // L only in frame 0, R only in frame 1.
        let input = pcm(&[1000, 0, 0, 500, 0, 0, 0, 1000, 0, 500, 0, 0]);
        assert_eq!(d.submit_input(&input), input.len());

        let mut out = Vec::new();
        let fmt = d.produce_output(&mut out);
        assert_eq!(
            fmt,
            OutputFormat {
                sample_rate: 44_100,
                channels: 2
            }
        );
        let s = samples(&out);
        assert_eq!(s.len(), 4);
        assert!(s[0] > 0 && s[1] == 0);
        assert!(s[2] == 0 && s[3] > 0);
    }

    #[test]
    fn downmixer_keeps_partial_frames_for_next_call() {
        let mut d = Downmixer::default();
        d.configure(CodecKind::ExternalPcm, 6, 48_000).unwrap();
        assert_eq!(d.submit_input(&[0; 20]), 12);
    }

    #[test]
    fn downmix_clamps_instead_of_wrapping() {
        let mut out = Vec::new();
        downmix_to_stereo(&[i16::MAX, i16::MAX, i16::MAX, 0, i16::MAX, i16::MAX], 6, &mut out);
        let s = samples(&out);
        assert_eq!(s, vec![i16::MAX, i16::MAX]);
    }

    #[test]
    fn mono_is_duplicated() {
        let mut out = Vec::new();
        downmix_to_stereo(&[7, -7], 1, &mut out);
        assert_eq!(samples(&out), vec![7, 7, -7, -7]);
    }

    #[test]
    fn dolby_digital_is_unavailable() {
        assert!(matches!(
            BuiltinDecoders.create(CodecKind::DolbyDigitalPlus),
            Err(DecodeError::Unavailable(_))
        ));
        assert!(BuiltinDecoders.create(CodecKind::Aac).is_ok());
    }
}
