use std::path::PathBuf;

use audio_session::{AudioFormat, DeviceMask};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "session-out", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML file with session tuning overrides
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream a raw file through an output session
    Play {
        /// Path to the raw stream (interleaved s16le for pcm16)
        path: PathBuf,

        /// Stream format, e.g. pcm16, aac, mp3, wma
        #[arg(long, default_value = "pcm16")]
        format: AudioFormat,

        #[arg(long, default_value_t = 2)]
        channels: u32,

        #[arg(long, default_value_t = 48_000)]
        rate: u32,

        /// Output devices, comma separated names or a numeric mask
        #[arg(long, default_value = "speaker", value_parser = DeviceMask::parse_list)]
        devices: DeviceMask,

        /// Where rendered audio goes
        #[arg(long, value_enum, default_value_t = Sink::Cpal)]
        sink: Sink,

        /// Bytes handed to each session write
        #[arg(long, default_value_t = 4096)]
        chunk_bytes: usize,

        /// Stream gain in 0.0..=1.0
        #[arg(long)]
        volume: Option<f32>,

        /// Print the final session status as JSON
        #[arg(long)]
        status_json: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Sink {
    /// Local output device via CPAL (linear PCM only)
    Cpal,
    /// Simulated hardware that consumes periods as fast as they arrive
    Null,
}
