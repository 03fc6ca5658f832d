use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use session_out::cli::{Args, Command};
use session_out::config::{FileConfig, PlayConfig};
use session_out::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_session=info,session_out=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let file = FileConfig::load(args.config.as_deref())?;
    match args.cmd {
        Some(Command::Play {
            path,
            format,
            channels,
            rate,
            devices,
            sink,
            chunk_bytes,
            volume,
            status_json,
        }) => runtime::run_play(PlayConfig {
            path,
            device: args.device.or(file.device),
            format,
            channels,
            sample_rate: rate,
            devices,
            sink,
            chunk_bytes,
            volume,
            status_json,
            session: file.session,
        }),
        None => {
            tracing::warn!("nothing to do; try `session-out play <file>` or --list-devices");
            Ok(())
        }
    }
}
