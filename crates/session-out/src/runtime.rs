//! Session runtime for the CLI.
//!
//! Opens one output session, feeds it a file in fixed-size writes and waits
//! for the hardware to drain before stopping.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audio_session::hw::HardwareDriver;
use audio_session::observer::EosObserver;
use audio_session::sim::SimDriver;
use audio_session::{
    ModeKind, OutputSession, SessionEnv, SessionError, SessionRequest, SessionState,
};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::cli::Sink;
use crate::config::PlayConfig;
use crate::device;
use crate::sink::CpalDriver;

/// Period size of the simulated hardware behind `--sink null`.
const NULL_PERIOD_BYTES: usize = 1024;
/// Extra wait on top of the reported latency before giving up on EOS.
const EOS_GRACE: Duration = Duration::from_secs(2);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

struct ChannelObserver(Sender<i32>);

impl EosObserver for ChannelObserver {
    fn notify_end_of_stream(&self, code: i32) {
        let _ = self.0.try_send(code);
    }
}

/// Play one file through an output session.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let driver: Arc<dyn HardwareDriver> = match config.sink {
        Sink::Cpal => Arc::new(CpalDriver::new(config.device.clone())),
        Sink::Null => Arc::new(SimDriver::with_auto_tick(NULL_PERIOD_BYTES)),
    };
    let env = SessionEnv::new(driver).with_config(config.session.clone());
    let request = SessionRequest {
        format: config.format,
        channels: config.channels,
        sample_rate: config.sample_rate,
        devices: config.devices,
        session_id: std::process::id() as i32,
    };
    let session = Arc::new(OutputSession::open(env, request).context("open output session")?);
    tracing::info!(
        format = %config.format,
        mode = ?session.mode(),
        rate_hz = session.sample_rate(),
        channels = session.channels(),
        devices = %session.devices(),
        "session opened"
    );

    let (eos_tx, eos_rx) = bounded(1);
    session.set_observer(Arc::new(ChannelObserver(eos_tx)));

    let session_for_signal = session.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if let Err(e) = session_for_signal.stop() {
            tracing::warn!("stop on signal failed: {e}");
        }
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    if let Some(volume) = config.volume {
        let volume = volume.clamp(0.0, 1.0);
        if let Err(e) = session.set_volume(volume, volume) {
            tracing::warn!("volume not applied: {e}");
        }
    }

    let written = feed_file(&session, &config)?;
    tracing::info!(bytes = written, "input consumed");

    if session.state() != SessionState::Stopped {
        wait_for_drain(&session, &eos_rx)?;
    }

    let status = session.status();
    if config.status_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        tracing::info!(
            frames = status.frames_written,
            state = ?status.state,
            "playback finished"
        );
    }
    session.stop().context("stop session")?;
    Ok(())
}

/// Write the file in `chunk_bytes` pieces. Returns the bytes accepted.
fn feed_file(session: &OutputSession, config: &PlayConfig) -> Result<usize> {
    let mut file =
        File::open(&config.path).with_context(|| format!("open {}", config.path.display()))?;
    let mut buf = vec![0u8; config.chunk_bytes.max(1)];
    let mut written = 0usize;
    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        match session.write(&buf[..n]) {
            Ok(accepted) => written += accepted,
            Err(SessionError::Stopped) => {
                tracing::info!("session stopped while writing");
                break;
            }
            Err(e) => return Err(e).context("session write"),
        }
        if n < buf.len() {
            break;
        }
    }
    Ok(written)
}

/// Fill `buf` from `reader` unless EOF comes first, so a short write only
/// ever happens at the real end of the stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("read input"),
        }
    }
    Ok(filled)
}

fn wait_for_drain(session: &OutputSession, eos_rx: &Receiver<i32>) -> Result<()> {
    let latency = Duration::from_millis(u64::from(session.latency_ms()));
    match session.mode() {
        ModeKind::Tunnel => {
            // A zero-length write marks end of stream when the last chunk was full.
            match session.write(&[]) {
                Ok(_) | Err(SessionError::Stopped) => {}
                Err(e) => return Err(e).context("signal end of stream"),
            }
            match eos_rx.recv_timeout(latency + EOS_GRACE) {
                Ok(code) => tracing::info!(code, "end of stream"),
                Err(_) => tracing::warn!("no end-of-stream notification; stopping anyway"),
            }
        }
        _ => {
            if let Err(e) = session.write(&[]) {
                if !matches!(e, SessionError::Stopped) {
                    tracing::debug!("final empty write: {e}");
                }
            }
            std::thread::sleep(latency);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_full_fills_until_eof() {
        let mut reader = Cursor::new(vec![7u8; 10]);
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 4);
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 2);
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 0);
    }

    fn play_config(path: std::path::PathBuf) -> PlayConfig {
        let mut session = audio_session::SessionConfig::default();
        session.force_spdif = false;
        session.tunnel_buffer_count = 4;
        PlayConfig {
            path,
            device: None,
            format: audio_session::AudioFormat::Pcm16,
            channels: 2,
            sample_rate: 48_000,
            devices: audio_session::DeviceMask::SPEAKER,
            sink: Sink::Null,
            chunk_bytes: 4096,
            volume: None,
            status_json: false,
            session,
        }
    }

    #[test]
    fn feed_file_writes_whole_input_to_null_sink() {
        let path = std::env::temp_dir().join(format!("session-out-{}.raw", std::process::id()));
        std::fs::write(&path, vec![0u8; 10_000]).unwrap();
        let config = play_config(path.clone());

        let driver = SimDriver::with_auto_tick(NULL_PERIOD_BYTES);
        let env = SessionEnv::new(Arc::new(driver.clone())).with_config(config.session.clone());
        let session = OutputSession::open(
            env,
            SessionRequest {
                format: config.format,
                channels: 2,
                sample_rate: 48_000,
                devices: config.devices,
                session_id: 1,
            },
        )
        .unwrap();

        assert_eq!(feed_file(&session, &config).unwrap(), 10_000);
        assert_eq!(
            driver.written_bytes(audio_session::hw::UseCase::Pcm),
            10_000
        );
        session.stop().unwrap();
        let _ = std::fs::remove_file(path);
    }
}
