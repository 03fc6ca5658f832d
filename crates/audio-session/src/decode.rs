//! Software decode stage for the decode-chain write path.
//!
//! A [`DecodeCapability`] turns compressed (or multichannel PCM) input into
//! interleaved 16-bit output. [`DecodeAdapter`] owns the accumulated input and
//! the pending output around one capability:
//! - input is appended until more than `min_bytes` is buffered
//! - each decode step submits the whole input and keeps the unconsumed tail
//! - output is handed out in period-sized slices for the PCM handle

use crate::error::DecodeError;
use crate::format::CodecKind;

/// Rate and channel count of decoded output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u32,
}

/// A software decoder.
pub trait DecodeCapability: Send {
    /// Prepare for `codec` with the stream's nominal channel count and rate.
    fn configure(
        &mut self,
        codec: CodecKind,
        channels: u32,
        sample_rate: u32,
    ) -> Result<(), DecodeError>;

    /// Out-of-band codec configuration (e.g. AAC AudioSpecificConfig).
    fn set_codec_config(&mut self, _config: &[u8]) -> Result<(), DecodeError> {
        Ok(())
    }

    /// Feed input; returns the number of bytes consumed.
    fn submit_input(&mut self, input: &[u8]) -> usize;

    /// Append all decoded output produced so far to `out` and report its format.
    fn produce_output(&mut self, out: &mut Vec<u8>) -> OutputFormat;
}

/// Factory for decode capabilities.
pub trait DecoderProvider: Send + Sync {
    fn create(&self, codec: CodecKind) -> Result<Box<dyn DecodeCapability>, DecodeError>;
}

/// Result of one decode call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStep {
    /// Not enough input buffered; nothing was submitted.
    Starved,
    /// Input was submitted but no output came back.
    Empty { consumed: usize },
    /// Output was produced.
    Produced {
        consumed: usize,
        bytes: usize,
        format: OutputFormat,
    },
}

/// Input accumulator plus output staging around one decoder.
pub struct DecodeAdapter {
    decoder: Box<dyn DecodeCapability>,
    input: Vec<u8>,
    output: Vec<u8>,
    min_bytes: usize,
    format: OutputFormat,
    config_pending: bool,
}

impl DecodeAdapter {
    /// `format` is the nominal output format until the decoder reports otherwise.
    pub fn new(
        decoder: Box<dyn DecodeCapability>,
        min_bytes: usize,
        format: OutputFormat,
        needs_codec_config: bool,
    ) -> Self {
        Self {
            decoder,
            input: Vec::new(),
            output: Vec::new(),
            min_bytes,
            format,
            config_pending: needs_codec_config,
        }
    }

    /// True until the first buffer has been consumed as codec configuration.
    pub fn needs_codec_config(&self) -> bool {
        self.config_pending
    }

    /// Hand `config` to the decoder. The buffer is consumed whether or not the
    /// decoder accepts it.
    pub fn apply_codec_config(&mut self, config: &[u8]) -> Result<(), DecodeError> {
        self.config_pending = false;
        self.decoder.set_codec_config(config)
    }

    pub fn min_bytes(&self) -> usize {
        self.min_bytes
    }

    pub fn push_input(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// Append `n` bytes of silence; used to flush the decoder at end of stream.
    pub fn pad_silence(&mut self, n: usize) {
        self.input.resize(self.input.len() + n, 0);
    }

    pub fn has_enough_input(&self) -> bool {
        self.input.len() > self.min_bytes
    }

    /// Run one decode call if enough input is buffered.
    pub fn decode_step(&mut self) -> DecodeStep {
        if !self.has_enough_input() {
            return DecodeStep::Starved;
        }
        let consumed = self.decoder.submit_input(&self.input).min(self.input.len());
        self.input.drain(..consumed);

        let before = self.output.len();
        let format = self.decoder.produce_output(&mut self.output);
        let bytes = self.output.len() - before;
        if bytes == 0 {
            return DecodeStep::Empty { consumed };
        }
        self.format = format;
        DecodeStep::Produced {
            consumed,
            bytes,
            format,
        }
    }

    /// Format of the most recent output.
    pub fn output_format(&self) -> OutputFormat {
        self.format
    }

    pub fn buffered_input(&self) -> usize {
        self.input.len()
    }

    pub fn buffered_output(&self) -> usize {
        self.output.len()
    }

    /// First full period of pending output, if one is available.
    pub fn next_period(&self, period_bytes: usize) -> Option<&[u8]> {
        if period_bytes == 0 || self.output.len() < period_bytes {
            return None;
        }
        Some(&self.output[..period_bytes])
    }

    pub fn consume_output(&mut self, n: usize) {
        let n = n.min(self.output.len());
        self.output.drain(..n);
    }

    /// Drop pending output without rendering it.
    pub fn discard_output(&mut self) {
        self.output.clear();
    }

    /// Forget buffered input and output (flush, standby).
    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}
